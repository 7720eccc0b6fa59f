//! Scheduler layer for the runner
//!
//! Accepted execution requests wait in a bounded queue and are run one at
//! a time by a single worker.

pub mod worker;

pub use worker::{JobQueue, SubmitError, Worker};
