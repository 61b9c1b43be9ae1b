//! # huddle-common
//!
//! Shared configuration, error handling, and identifiers used across all Huddle crates.
//! No call logic lives here, just primitives and contracts.

pub mod config;
pub mod error;
pub mod ids;

pub use error::{ErrorClass, HuddleError, Result};
