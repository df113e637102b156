//! Scheduling primitives for the reconcile core: a deduplicating FIFO job
//! queue, a delayed-delivery queue, and a per-key backoff strategy.

pub mod backoff;
pub mod delay;
pub mod job;

pub use backoff::Strategy;
pub use delay::TimeoutQueue;
pub use job::{Action, Job, JobQueue, QueueError};
