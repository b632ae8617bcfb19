//! Core types
//!
//! - [`rule`]: the abstract rule model shared by every backend
//! - [`error`]: error types for firewall operations

pub mod error;
pub mod rule;
