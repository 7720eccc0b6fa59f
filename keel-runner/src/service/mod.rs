//! Service layer
//!
//! Business logic of the agent: running steps, tracking their cancellation
//! handles and delivering their output to the orchestrator.

pub mod cancel_registry;
pub mod execution;
pub mod outbox;

pub use cancel_registry::CancelRegistry;
pub use execution::{Executor, StepOutcome};
pub use outbox::{EventTransport, Outbox, OutboxConfig};
