//! Provides [`AllocationBitmap`], the lock-free slot allocator of a block.
//!
//! The bitmap holds one bit per slot, set when the slot is occupied.
//! All access to it is atomic, and the only mutation is [`AllocationBitmap::try_allocate_one`],
//! which flips exactly one bit from 0 to 1 per successful call.
//!
//! # Invariant: at-most-once ownership of each bit
//!
//! A bit is handed out by the one `compare_exchange` that observed it as 0
//! and successfully installed a word with it set.
//! Every other concurrent caller either fails that exchange, and retries with the value it observed,
//! or observes the bit as already set.
//! As bits never go from 1 back to 0 while the block is live,
//! a caller that has observed every word as full knows the block is full.
//!
//! The exchange uses `AcqRel` on success,
//! so that a winner sees everything published by earlier winners of the same word,
//! and `Acquire` on failure, as the observed value seeds the next attempt.

use crate::indexes::{alloc_bitmap_words, SlotOffset, ALLOC_WORD_BITS};
use core::slice::Iter;
use core::sync::atomic::{AtomicU64, Ordering};

/// A view of a block's allocation bitmap.
#[derive(Clone, Copy)]
pub struct AllocationBitmap<'block> {
    /// The words of the bitmap, bit `i % 64` of word `i / 64` standing for slot `i`.
    words: &'block [AtomicU64],
    /// The number of slots, i.e., of meaningful bits.
    /// The bits past it in the last word are never handed out.
    num_slots: u32,
}

impl<'block> AllocationBitmap<'block> {
    /// Returns a view over `words` for a bitmap of `num_slots` bits.
    pub fn new(words: &'block [AtomicU64], num_slots: u32) -> Self {
        debug_assert_eq!(words.len(), alloc_bitmap_words(num_slots as usize));
        Self { words, num_slots }
    }

    /// Returns the mask of bits in `word_idx` that stand for actual slots.
    #[inline]
    fn valid_mask(&self, word_idx: usize) -> u64 {
        let bits_before = word_idx * ALLOC_WORD_BITS;
        let bits_here = (self.num_slots as usize - bits_before).min(ALLOC_WORD_BITS);
        if bits_here == ALLOC_WORD_BITS {
            u64::MAX
        } else {
            (1 << bits_here) - 1
        }
    }

    /// Claims one free slot, returning its offset, or `None` if every slot is taken
    /// or the bitmap has no slots.
    ///
    /// The scan starts at the word `start_word`, modulo the number of words,
    /// and wraps around once, so that every word is looked at.
    /// Within a word, the lowest free bit is tried first.
    ///
    /// Safe to call from any number of threads at once;
    /// no two calls ever return the same offset.
    pub fn try_allocate_one(&self, start_word: usize) -> Option<SlotOffset> {
        let num_words = self.words.len();
        if num_words == 0 {
            // No slots at all, so nothing to hand out.
            return None;
        }
        let start_word = start_word % num_words;

        for word_idx in (start_word..num_words).chain(0..start_word) {
            let word = &self.words[word_idx];
            let valid = self.valid_mask(word_idx);
            let mut current = word.load(Ordering::Acquire);
            loop {
                let free = !current & valid;
                if free == 0 {
                    // Word exhausted; move on to the next one.
                    break;
                }
                let bit: u64 = 1 << free.trailing_zeros();
                match word.compare_exchange_weak(current, current | bit, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        let slot = word_idx * ALLOC_WORD_BITS + bit.trailing_zeros() as usize;
                        return Some(SlotOffset(slot as u32));
                    }
                    // Lost the race, or spurious failure; retry with what's there now.
                    Err(observed) => current = observed,
                }
            }
        }

        None
    }

    /// Converts `slot` to its word index and the mask for it within the word.
    #[inline]
    fn slot_to_pos(slot: SlotOffset) -> (usize, u64) {
        let idx = slot.idx();
        (idx / ALLOC_WORD_BITS, 1 << (idx % ALLOC_WORD_BITS))
    }

    /// Returns whether `slot` is allocated.
    pub fn is_set(&self, slot: SlotOffset) -> bool {
        debug_assert!(slot.0 < self.num_slots);
        let (word_idx, mask) = Self::slot_to_pos(slot);
        self.words[word_idx].load(Ordering::Acquire) & mask != 0
    }

    /// Returns the number of allocated slots.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Returns all the allocated slots in ascending order.
    ///
    /// Each word is loaded once, when the iterator reaches it,
    /// so slots allocated concurrently may or may not be yielded.
    pub fn iter_set(&self) -> IterSet<'block> {
        let mut inner = self.words.iter();

        // Fetch the first word; if it isn't there, use an all-zero one.
        // This will cause the iterator to terminate immediately.
        let curr = inner.next().map_or(0, |w| w.load(Ordering::Acquire));

        IterSet {
            inner,
            curr,
            word_idx: 0,
        }
    }
}

/// An iterator that yields the allocated slots of an [`AllocationBitmap`].
pub struct IterSet<'block> {
    /// The word iterator.
    inner: Iter<'block, AtomicU64>,
    /// The current word being processed, taken from `self.inner`.
    curr: u64,
    /// What the index of `self.curr` is.
    word_idx: u32,
}

impl Iterator for IterSet<'_> {
    type Item = SlotOffset;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tz = self.curr.trailing_zeros();
            if tz < u64::BITS {
                // Some bit was set; so yield the index of that
                // and zero the bit out so we don't yield it again.
                self.curr &= self.curr.wrapping_sub(1);
                return Some(SlotOffset(self.word_idx * u64::BITS + tz));
            } else {
                // No bit is set; advance to the next word, or quit if none left.
                self.curr = self.inner.next()?.load(Ordering::Acquire);
                self.word_idx += 1;
            }
        }
    }
}
