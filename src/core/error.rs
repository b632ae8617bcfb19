use thiserror::Error;

use crate::core::rule::Protocol;

/// Core error types for hostwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The packet-filter control tool (iptables/nft) returned a failure
    #[error("{tool} error: {message}")]
    Command {
        tool: &'static str,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// A blocking rule targeted a port that must always stay open
    #[error("rule '{rule_id}' would block immutable port {port}/{protocol}")]
    ImmutablePort {
        rule_id: String,
        port: u16,
        protocol: Protocol,
    },

    /// Operation refused because it would remove a permanent protection
    #[error("policy violation: {0}")]
    Policy(String),

    /// A batch failed part-way; everything it installed has been removed again
    #[error("batch rolled back: rule #{index} ('{rule_id}') failed: {source}")]
    Batch {
        index: usize,
        rule_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Kernel logging channel could not be used
    #[error("capture error: {0}")]
    Capture(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True for errors produced by local policy checks rather than the kernel.
    pub fn is_policy(&self) -> bool {
        matches!(self, Error::ImmutablePort { .. } | Error::Policy(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immutable_port_message_names_rule_and_port() {
        let err = Error::ImmutablePort {
            rule_id: "sg-web-1".to_string(),
            port: 22,
            protocol: Protocol::Tcp,
        };
        let msg = err.to_string();
        assert!(msg.contains("sg-web-1"));
        assert!(msg.contains("22/tcp"));
        assert!(err.is_policy());
    }

    #[test]
    fn test_batch_error_keeps_source() {
        let err = Error::Batch {
            index: 2,
            rule_id: "r3".to_string(),
            source: Box::new(Error::Command {
                tool: "iptables",
                message: "Bad argument".to_string(),
                stderr: None,
                exit_code: Some(2),
            }),
        };
        assert!(err.to_string().contains("r3"));
        assert!(err.to_string().contains("Bad argument"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_policy());
    }

    #[test]
    fn test_validation_helper() {
        let err = Error::validation("port_end", "must be >= port");
        assert_eq!(err.to_string(), "Validation error in port_end: must be >= port");
    }
}
