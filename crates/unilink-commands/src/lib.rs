//! Command system for device control.
//!
//! Provides:
//! - Bounded per-device command queue with priority or FIFO ordering
//! - Overflow handling (reject or evict oldest)
//! - Command processor with bounded concurrency, per-command timeouts and
//!   retry budgets
//! - The [`CommandExecutor`] seam the device layer implements

pub mod processor;
pub mod queue;

pub use processor::{CommandExecutor, CommandProcessor, CommandTicket};
pub use queue::{CommandQueue, QueueEntry, QueueError, QueueStats};

pub use unilink_core::config::{OverflowPolicy, ProcessorConfig, QueueConfig, QueueOrdering};
