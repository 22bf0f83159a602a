//! Provides [`BlockStore`], a bounded pool handing out [`RawBlock`]s.
//!
//! At most `max_blocks` blocks are outstanding at any time.
//! Once that many are out, [`BlockStore::new_block`] waits until one comes back,
//! while [`BlockStore::try_new_block`] fails right away.
//!
//! Blocks are handed out as [`BlockHandle`]s owning the buffer.
//! Returning a block, by [`BlockStore::deallocate`] or by dropping its handle,
//! consumes the handle, so no access to the block can outlive its return.
//! Returned buffers are kept for reuse, but their identifiers never are.

use crate::config::BlockStoreConfig;
use crate::indexes::BlockId;
use crate::layout::BlockLayout;
use crate::raw_block::{initialize_raw_block, RawBlock};
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockStoreError {
    #[error("All {max_blocks} blocks of the store are outstanding")]
    Exhausted { max_blocks: usize },
}

/// A bounded pool of blocks.
///
/// Cloning a `BlockStore` is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<BlockStoreInner>,
}

impl BlockStore {
    /// Returns a new store handing out at most `max_blocks` blocks at once.
    ///
    /// Panics if `max_blocks` is zero.
    pub fn new(max_blocks: usize) -> Self {
        assert!(max_blocks > 0, "a block store must be able to hand out at least one block");
        let inner = Arc::new(BlockStoreInner::new(max_blocks));
        Self { inner }
    }

    /// Returns a new store configured by `config`.
    pub fn from_config(config: &BlockStoreConfig) -> Self {
        Self::new(config.max_blocks)
    }

    /// Returns a zero-filled block with a fresh identifier,
    /// waiting for another block to be returned if `max_blocks` are outstanding.
    ///
    /// The block must be initialized, e.g., with [`BlockHandle::initialize`], before use.
    pub fn new_block(&self) -> BlockHandle {
        self.inner.acquire();
        BlockStoreInner::take(&self.inner)
    }

    /// Returns a zero-filled block with a fresh identifier,
    /// or an error if `max_blocks` are outstanding.
    pub fn try_new_block(&self) -> Result<BlockHandle, BlockStoreError> {
        if !self.inner.try_acquire() {
            return Err(BlockStoreError::Exhausted {
                max_blocks: self.inner.max_blocks,
            });
        }
        Ok(BlockStoreInner::take(&self.inner))
    }

    /// Returns `block` to the store.
    ///
    /// Same as dropping the handle.
    pub fn deallocate(&self, block: BlockHandle) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &block.store),
            "block {} returned to a store which did not hand it out",
            block.id
        );
        drop(block);
    }

    /// Returns the number of blocks currently handed out.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.lock()
    }

    /// Returns the maximum number of blocks handed out at once.
    pub fn max_blocks(&self) -> usize {
        self.inner.max_blocks
    }

    /// Returns the number of fresh blocks allocated by the store.
    pub fn new_blocks_allocated_count(&self) -> usize {
        self.inner.new_blocks_allocated_count.load(Ordering::Relaxed)
    }

    /// Returns the number of blocks handed out again after having been returned.
    pub fn blocks_reused_count(&self) -> usize {
        self.inner.blocks_reused_count.load(Ordering::Relaxed)
    }

    /// Returns the number of blocks returned to the store.
    pub fn blocks_returned_count(&self) -> usize {
        self.inner.blocks_returned_count.load(Ordering::Relaxed)
    }
}

/// The inner actual block store containing all the logic.
struct BlockStoreInner {
    max_blocks: usize,
    /// Returned buffers, ready for reuse.
    free_blocks: ArrayQueue<Box<RawBlock>>,
    /// The number of blocks handed out and not yet returned.
    outstanding: Mutex<usize>,
    /// Signalled whenever `outstanding` goes down.
    block_returned: Condvar,
    /// The identifier of the next block handed out.
    next_id: AtomicU64,
    new_blocks_allocated_count: AtomicUsize,
    blocks_reused_count: AtomicUsize,
    blocks_returned_count: AtomicUsize,
}

#[inline]
fn inc(atomic: &AtomicUsize) {
    atomic.fetch_add(1, Ordering::Relaxed);
}

impl BlockStoreInner {
    fn new(max_blocks: usize) -> Self {
        Self {
            max_blocks,
            // At most `max_blocks` are out, so the queue never overflows.
            free_blocks: ArrayQueue::new(max_blocks),
            outstanding: Mutex::new(0),
            block_returned: Condvar::new(),
            next_id: AtomicU64::new(1),
            new_blocks_allocated_count: <_>::default(),
            blocks_reused_count: <_>::default(),
            blocks_returned_count: <_>::default(),
        }
    }

    /// Reserves one of the `max_blocks`, waiting for a return if none is left.
    fn acquire(&self) {
        let mut outstanding = self.outstanding.lock();
        if *outstanding >= self.max_blocks {
            log::debug!("all {} blocks outstanding, waiting for a block to be returned", self.max_blocks);
            while *outstanding >= self.max_blocks {
                self.block_returned.wait(&mut outstanding);
            }
        }
        *outstanding += 1;
    }

    /// Reserves one of the `max_blocks`, returning whether one was left.
    fn try_acquire(&self) -> bool {
        let mut outstanding = self.outstanding.lock();
        if *outstanding >= self.max_blocks {
            return false;
        }
        *outstanding += 1;
        true
    }

    /// Gives back a reservation made by `acquire` or `try_acquire`.
    fn release(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding -= 1;
        drop(outstanding);
        self.block_returned.notify_one();
    }

    /// Takes a buffer from the pool, or allocates a fresh one, and wraps it in a handle.
    ///
    /// The caller must hold a reservation.
    fn take(this: &Arc<Self>) -> BlockHandle {
        let block = this
            .free_blocks
            .pop()
            .map(|mut block| {
                inc(&this.blocks_reused_count);
                block.zero();
                block
            })
            .unwrap_or_else(|| {
                inc(&this.new_blocks_allocated_count);
                RawBlock::new_zeroed()
            });

        let id = BlockId(this.next_id.fetch_add(1, Ordering::Relaxed));
        debug_assert!(id <= BlockId::MAX, "ran out of block identifiers");
        log::trace!("handing out block {id}");

        BlockHandle {
            id,
            block: ManuallyDrop::new(block),
            store: this.clone(),
        }
    }

    /// Puts a buffer back into the pool and gives back its reservation.
    fn put(&self, id: BlockId, block: Box<RawBlock>) {
        // There's always room, but if there weren't, we'd just drop the buffer.
        let _ = self.free_blocks.push(block);
        inc(&self.blocks_returned_count);
        log::trace!("block {id} returned");
        self.release();
    }
}

/// Exclusive ownership of a block handed out by a [`BlockStore`].
///
/// Dereferences to the [`RawBlock`].
/// Share it between threads as `&RawBlock`.
/// Dropping the handle returns the block to its store.
pub struct BlockHandle {
    id: BlockId,
    block: ManuallyDrop<Box<RawBlock>>,
    store: Arc<BlockStoreInner>,
}

impl BlockHandle {
    /// Returns the identifier the store assigned to this block.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Prepares the block for use under `layout`, stamping it with [`BlockHandle::id`].
    ///
    /// See [`initialize_raw_block`].
    pub fn initialize(&mut self, layout: &BlockLayout) {
        let id = self.id;
        initialize_raw_block(self, layout, id);
    }
}

impl Deref for BlockHandle {
    type Target = RawBlock;

    fn deref(&self) -> &RawBlock {
        &self.block
    }
}

impl DerefMut for BlockHandle {
    fn deref_mut(&mut self) -> &mut RawBlock {
        &mut self.block
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        // SAFETY: `self.block` is never touched again after this.
        let block = unsafe { ManuallyDrop::take(&mut self.block) };
        self.store.put(self.id, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::addr_eq;
    use std::thread;
    use std::time::Duration;

    fn assert_metrics(store: &BlockStore, outstanding: usize, new: usize, reused: usize, returned: usize) {
        assert_eq!(store.outstanding(), outstanding);
        assert_eq!(store.new_blocks_allocated_count(), new);
        assert_eq!(store.blocks_reused_count(), reused);
        assert_eq!(store.blocks_returned_count(), returned);
    }

    #[test]
    fn block_store_reuses_buffers_but_not_ids() {
        let store = BlockStore::new(4);
        assert_metrics(&store, 0, 0, 0, 0);

        // Take a block, dirty it, and give it back.
        let mut block1 = store.new_block();
        assert_metrics(&store, 1, 1, 0, 0);
        let block1_id = block1.id();
        let block1_ptr = &*block1 as *const RawBlock;
        let layout = BlockLayout::new(&[8]).unwrap();
        block1.initialize(&layout);
        store.deallocate(block1);
        assert_metrics(&store, 0, 1, 0, 1);

        // Taking a block again yields the same buffer, wiped, under a new id.
        let block2 = store.new_block();
        assert_metrics(&store, 1, 1, 1, 1);
        assert!(addr_eq(&*block2 as *const RawBlock, block1_ptr));
        assert!(block2.id() > block1_id);
        assert_eq!(block2.block_id(), BlockId(0));

        // Dropping a handle returns the block just like `deallocate`.
        drop(block2);
        assert_metrics(&store, 0, 1, 1, 2);
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let store = BlockStore::new(3);
        let blocks: Vec<_> = (0..3).map(|_| store.new_block()).collect();
        let ids: Vec<_> = blocks.iter().map(BlockHandle::id).collect();
        assert_eq!(ids, [BlockId(1), BlockId(2), BlockId(3)]);
        assert_metrics(&store, 3, 3, 0, 0);
    }

    #[test]
    fn try_new_block_fails_when_exhausted() {
        let store = BlockStore::new(2);
        let a = store.try_new_block().unwrap();
        let _b = store.try_new_block().unwrap();
        assert_eq!(
            store.try_new_block().unwrap_err(),
            BlockStoreError::Exhausted { max_blocks: 2 }
        );

        store.deallocate(a);
        assert!(store.try_new_block().is_ok());
    }

    #[test]
    fn new_block_waits_for_a_return() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp(None)
            .is_test(true)
            .try_init();

        let store = BlockStore::new(1);
        let held = store.new_block();
        let held_id = held.id();

        thread::scope(|s| {
            let waiter = s.spawn(|| store.new_block().id());
            // Give the waiter a chance to block.
            thread::sleep(Duration::from_millis(50));
            assert_eq!(store.outstanding(), 1);
            store.deallocate(held);
            let got = waiter.join().unwrap();
            assert_ne!(got, held_id);
        });
        assert_metrics(&store, 0, 1, 1, 2);
    }

    #[test]
    fn many_threads_share_a_small_store() {
        const NUM_THREADS: usize = 8;
        const ROUNDS: usize = 100;
        let store = BlockStore::new(2);

        thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let block = store.new_block();
                        assert!(store.outstanding() <= 2);
                        store.deallocate(block);
                    }
                });
            }
        });

        let total = NUM_THREADS * ROUNDS;
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.blocks_returned_count(), total);
        assert_eq!(store.new_blocks_allocated_count() + store.blocks_reused_count(), total);
        assert!(store.new_blocks_allocated_count() <= 2);
    }
}
