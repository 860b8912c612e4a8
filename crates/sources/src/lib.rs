//! # Sources
//!
//! Demand-honoring publishers and a collecting subscriber.
//!
//! Responsibilities:
//! - Feed stages from an in-memory list (`IterSource`) or a live channel
//!   (`ChannelSource`), never emitting past the requested demand
//! - Record what reaches the end of a pipeline (`CollectSink`)
//!
//! ## Usage Example
//!
//! ```ignore
//! use contracts::Publisher;
//! use sources::{CollectSink, IterSource};
//!
//! let sink = CollectSink::unbounded();
//! IterSource::new(vec![1, 2, 3]).subscribe(sink.clone());
//! assert_eq!(sink.values(), vec![1, 2, 3]);
//! ```

mod channel;
mod collect;
mod iter;
mod stats;

// Re-exports
pub use channel::ChannelSource;
pub use collect::{CollectSink, Terminal};
pub use iter::IterSource;
pub use stats::{SourceStats, StatsSnapshot};
