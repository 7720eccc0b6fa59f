//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs exchanged between the control plane, execution
//! agents and API callers. DTOs are lightweight representations of domain
//! entities shaped for network transfer.

pub mod event;
pub mod job;
pub mod log;
pub mod pipeline;
pub mod runner;
