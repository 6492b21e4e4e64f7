//! pmextent core - extent logs and free space for a persistent-memory filesystem
//!
//! Every inode maps its logical pages to physical blocks through an
//! append-only, copy-on-write log of extent entries stored in a chain of
//! log pages. A write never overwrites live data or metadata in place: new
//! data goes to freshly allocated blocks, a new entry is appended, earlier
//! entries it overlaps are tagged as invalidated, and the inode's durable
//! `{log_head, log_tail}` record is advanced as the single commit point.
//! Free space is a set of disjoint block ranges managed by a first-fit
//! allocator that merges neighbours on release.
//!
//! The crate is organised as:
//!
//! - [`blockdev`]: the persistent block device abstraction, a file-backed
//!   device and an in-memory device with power-loss injection
//! - [`layout`]: on-media encodings (volume header, entries, inode records)
//! - [`allocator`]: the free block range allocator
//! - [`log`]: per-inode extent logs, traversal and compaction
//! - [`store`]: a formatted volume with per-inode locking and recovery
//! - [`telemetry`]: operation counters and timings

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod allocator;
pub mod blockdev;
pub mod config;
pub mod error;
pub mod inode_table;
pub mod inspect;
pub mod layout;
pub mod log;
pub mod store;
pub mod telemetry;

// Re-export the error types
pub use error::{Error, Result};

pub use allocator::{AllocError, BlockRange, BlockRangeAllocator};
pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, MemBlockDevice, BLOCK_SIZE};
pub use config::StoreConfig;
pub use inspect::{EntryReport, FreePoolReport, LogReport};
pub use layout::{ExtentEntry, Geometry, LogPosition};
pub use log::{AppendOutcome, CompactionOutcome, CompactionPolicy, ExtentLog, LogError, Segment};
pub use store::{ExtentStore, StoreReport};
pub use telemetry::{OpKind, Telemetry, TelemetrySnapshot};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, BLOCK_SIZE};
    pub use crate::config::StoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::store::ExtentStore;
}
