//! Biolog Common Library
//!
//! Shared error handling, logging setup, and checksum utilities for the
//! biolog workspace.
//!
//! # Example
//!
//! ```no_run
//! use biolog_common::{Result, BiologError};
//! use biolog_common::checksum::compute_file_sha256;
//!
//! fn audit_file(path: &str) -> Result<()> {
//!     let digest = compute_file_sha256(path)?;
//!     tracing::info!(%digest, "archived file hashed");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{BiologError, Result};
