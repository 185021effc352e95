//! Offset ledger for transactional produce verification
//!
//! Records, per partition, the offsets a producer has verified as landing
//! exactly where it predicted. The ledger is written by the producer and read
//! back by a consumer-side validator through its persisted JSON form.
//!
//! # Architecture
//!
//! - `OffsetRanges` - sorted, merged `[lower, upper)` ranges for one partition
//! - `TopicOffsetRanges` - one `OffsetRanges` per partition, each behind its
//!   own lock, plus `load`/`store` against a ledger directory
//!
//! # Example
//!
//! ```rust,no_run
//! use offset_ledger::TopicOffsetRanges;
//!
//! fn main() -> offset_ledger::Result<()> {
//!     let ledger = TopicOffsetRanges::load("/tmp/ledger", "verifier", 3)?;
//!     ledger.insert(0, 41)?;
//!     ledger.insert(0, 42)?;
//!     ledger.store()?;
//!     Ok(())
//! }
//! ```

mod error;
mod ranges;
mod topic;


pub use error::{Error, Result};
pub use ranges::{OffsetRange, OffsetRanges};
pub use topic::{StoredOffsetRanges, TopicOffsetRanges};
