//! hostwall - host firewall control plane
//!
//! Turns a declarative rule model into kernel packet-filter state and streams
//! the traffic those rules see back to observers.
//!
//! # Architecture
//!
//! - [`backend`] - iptables / nftables / in-memory mechanisms behind one trait
//! - [`manager`] - serialized rule lifecycle, immutable ports, batch rollback
//! - [`capture`] - NFLOG capture and packet decode
//! - [`bridge`] - internal-traffic filter and rate limit between capture and hub
//! - [`hub`] - event broadcast actor
//! - [`observer`] - line-delimited JSON endpoint for observers
//! - [`core`] - rule model and error types
//! - [`validators`] - input validation
//! - [`elevation`] - privileged tool invocation
//! - [`config`] - daemon configuration
//! - [`utils`] - XDG paths, interface lookup
//!
//! # Safety Features
//!
//! - Managed rules live in dedicated chains; the host's own rules are never touched
//! - Immutable ports (SSH by default) can never be blocked
//! - Batches roll back completely on failure
//! - Slow observers lose events instead of stalling the pipeline

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod backend;
pub mod bridge;
pub mod capture;
pub mod config;
pub mod core;
pub mod elevation;
pub mod hub;
pub mod manager;
pub mod observer;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::rule::{Action, Direction, ImmutablePort, Protocol, Rule};
pub use manager::Manager;
