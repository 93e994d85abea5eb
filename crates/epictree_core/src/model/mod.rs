//! Data model shared by every conversion entry point.
//!
//! # Responsibility
//! - Define the raw source-tree shape produced by source adapters.
//! - Define the canonical five-level export document.
//! - Define the dynamic value type both sides carry.
//!
//! # Invariants
//! - Raw trees vary in depth and field spelling; the document never does.
//! - The document is built once per run and not mutated after writing.

pub mod document;
pub mod raw;
pub mod value;
