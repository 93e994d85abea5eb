//! Export use-case services.
//!
//! # Responsibility
//! - Orchestrate flattening, reference resolution and writing into one
//!   export run.
//! - Keep the CLI decoupled from transform and codec details.

pub mod export_service;
