//! Keel Core
//!
//! Core types and abstractions for the Keel pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, Step, Job, JobRunner, Runner)
//! - DTOs: Data transfer objects for control plane <-> agent communication

pub mod domain;
pub mod dto;
