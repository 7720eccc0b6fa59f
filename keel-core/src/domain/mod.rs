//! Core domain types
//!
//! This module contains the core domain structures used across Keel services.
//! These types are shared between the orchestrator (which persists and
//! schedules them) and the runner (which executes them).

pub mod job;
pub mod job_runner;
pub mod log;
pub mod pipeline;
pub mod runner;
