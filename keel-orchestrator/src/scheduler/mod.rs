//! Scheduler Module
//!
//! The two long-lived workers of the control plane. They share nothing but
//! the store and each other's queue handles.

pub mod aggregator;
pub mod dispatcher;
pub mod transport;

pub use aggregator::{Aggregator, AggregatorHandle};
pub use dispatcher::{DispatchHandle, Dispatcher};
pub use transport::{AgentTransport, HttpAgentTransport};
