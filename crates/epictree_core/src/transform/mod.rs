//! Raw tree → canonical document pipeline.
//!
//! # Responsibility
//! - `extract`: per-level field schemas and defaults.
//! - `params`: nested parameter blob flattening.
//! - `sanitize`: interchange type coercion.
//! - `flatten`: orchestration into the five-level document.
//! - `resolve`: lazy/eager sample payload materialization.

pub mod cell_types;
pub mod extract;
pub mod flatten;
pub mod params;
pub mod resolve;
pub mod sanitize;
