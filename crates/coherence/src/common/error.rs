//! Recoverable error types.
//!
//! The coherence engine separates failures into three classes. This module defines the
//! only class that is surfaced as a `Result`:
//! 1. **Configuration Errors:** Unknown policy/directory names and invalid geometry,
//!    detected once while building controllers.
//! 2. **Checkpoint Errors:** I/O and JSON failures while saving or restoring directory
//!    state.
//!
//! Protocol-design errors and invariant violations are not represented here: they abort
//! the run with a diagnostic, since continuing would produce meaningless results. Resource
//! exhaustion is not an error at all and is reported as a boolean.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving a [`Config`](crate::config::Config) into controllers.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested protocol policy is not registered.
    #[error("unknown coherence policy '{0}' (known: {known})", known = crate::policy::POLICY_NAMES.join(", "))]
    UnknownPolicy(String),

    /// The requested directory organisation is not registered.
    #[error("unknown directory type '{0}' (known: Infinite, Standard)")]
    UnknownDirectory(String),

    /// A parameter passed to a policy or directory was not recognised.
    #[error("unrecognized parameter '{key}' for {component}")]
    UnknownParameter {
        /// Component that rejected the parameter.
        component: &'static str,
        /// Offending key.
        key: String,
    },

    /// A parameter value could not be parsed or is out of range.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Parameter name.
        key: &'static str,
        /// Raw value as supplied.
        value: String,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// A geometry parameter that must be a non-zero power of two is not.
    #[error("{key} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo {
        /// Parameter name.
        key: &'static str,
        /// Supplied value.
        value: u64,
    },

    /// The configuration document is not valid JSON or has the wrong shape.
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while saving or loading a directory checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint file could not be read or written.
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The checkpoint file is not valid JSON or has the wrong record layout.
    #[error("malformed checkpoint {path}: {source}")]
    Json {
        /// File being parsed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A sharer bitstring contains characters other than `0`/`1` or is too wide.
    #[error("bad sharer bitstring '{bits}' for tag {tag:#x}: {reason}")]
    BadSharers {
        /// Tag of the offending record.
        tag: u64,
        /// Raw bitstring.
        bits: String,
        /// Why the bitstring was rejected.
        reason: &'static str,
    },

    /// A record maps to a directory set that has no free way.
    #[error("no free way for checkpoint tag {tag:#x} in set {set}")]
    SetFull {
        /// Tag of the record that did not fit.
        tag: u64,
        /// Directory set the record maps to.
        set: usize,
    },
}
