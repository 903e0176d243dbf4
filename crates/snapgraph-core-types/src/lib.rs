//! Core types shared across snapgraph facilities
//!
//! This crate provides foundational types used by the error, logging and
//! session layers:
//!
//! - **Correlation types**: SessionId, CommitId
//! - **Schema constants**: Canonical field keys and event names

pub mod correlation;
pub mod schema;

pub use correlation::{CommitId, SessionId};
