//! Common error types for vipcare components.

use std::fmt;

/// A specialized Result type for vipcare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for vipcare operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("IPVS error: {0}")]
    Ipvs(String),

    #[error("rule error: {0}")]
    Rules(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Returned by `try_run` when a reconciliation pass is already queued.
    /// Expected under normal operation, not a fault.
    #[error("currently unavailable, one task in the queue")]
    Busy,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new parse error.
    pub fn parse(msg: impl fmt::Display) -> Self {
        Error::Parse(msg.to_string())
    }

    /// Create a new IPVS error.
    pub fn ipvs(msg: impl fmt::Display) -> Self {
        Error::Ipvs(msg.to_string())
    }

    /// Create a new rule-plane error.
    pub fn rules(msg: impl fmt::Display) -> Self {
        Error::Rules(msg.to_string())
    }

    /// Create a new probe error.
    pub fn probe(msg: impl fmt::Display) -> Self {
        Error::Probe(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
