//! Identifiers and error primitives shared by the job storage crates.
//!
//! This crate has no storage or runtime dependencies.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, ensure_not_blank};
pub use id::JobId;
