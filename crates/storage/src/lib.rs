//! The in-memory tuple storage layer.
//!
//! Tuples of fixed-width attributes are stored column-wise in 4 KiB blocks.
//! - [`BlockLayout`] computes, for a list of attribute widths,
//!   how many tuples fit into a block and where each column lives.
//! - [`BlockStore`] hands out blocks, bounded by a maximum count.
//! - [`TupleAccessStrategy`] allocates slots in a block and gives access to their attribute bytes.
//!
//! Slot allocation is lock-free, so many threads may insert into one block at once.

pub mod alloc_bitmap;
pub mod block_store;
pub mod config;
pub mod indexes;
pub mod layout;
pub mod raw_block;
pub mod tuple_access;
pub mod util;

#[cfg(any(test, feature = "proptest"))]
pub mod proptest_layout;

pub use block_store::{BlockHandle, BlockStore, BlockStoreError};
pub use config::{BlockStoreConfig, ConfigError, StorageConfig};
pub use indexes::{BlockId, ColId, SlotOffset, TupleSlot, BLOCK_SIZE};
pub use layout::{BlockLayout, LayoutError};
pub use raw_block::{initialize_raw_block, RawBlock};
pub use tuple_access::TupleAccessStrategy;
