//! Unified error types for the module kernel.
//!
//! A single `Error` enum that every subsystem converts into, so the
//! orchestrator can isolate, log and report failures uniformly.  Variants
//! carry the module and operation they concern so a log line is enough to
//! locate the fault.

use core::fmt;

use crate::module::ModuleStatus;

// ---------------------------------------------------------------------------
// Top-level kernel error
// ---------------------------------------------------------------------------

/// Every fallible kernel operation funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration is malformed, missing a key, or has the wrong type.
    Config(ConfigError),
    /// A lifecycle call failed inside the module, or a declared
    /// dependency could not be resolved.
    Init {
        module: String,
        op: &'static str,
        reason: String,
    },
    /// The operation is not permitted from the module's current state.
    StateConflict {
        module: String,
        op: &'static str,
        state: ModuleStatus,
    },
    /// A module, service or constructor with this name already exists.
    AlreadyRegistered(String),
    /// No module, service or constructor with this name.
    NotFound(String),
    /// The service exists but its interface has a different type.
    TypeMismatch(String),
    /// The resource is held by another owner.
    AlreadyLocked { resource: String, owner: String },
    /// The caller does not own the resource it tried to release.
    NotOwner { resource: String, owner: String },
    /// The event queue is saturated; the event was dropped.
    QueueFull(String),
    /// A fixed-capacity table or name buffer is exhausted.
    Allocation(&'static str),
    /// An argument is out of range (resource id, name length, ...).
    InvalidArgument(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Init { module, op, reason } => {
                write!(f, "module '{module}' {op} failed: {reason}")
            }
            Self::StateConflict { module, op, state } => {
                write!(f, "module '{module}' cannot {op} while {state}")
            }
            Self::AlreadyRegistered(name) => write!(f, "'{name}' already registered"),
            Self::NotFound(name) => write!(f, "'{name}' not found"),
            Self::TypeMismatch(name) => write!(f, "'{name}' has a different interface type"),
            Self::AlreadyLocked { resource, owner } => {
                write!(f, "{resource} already locked by '{owner}'")
            }
            Self::NotOwner { resource, owner } => {
                write!(f, "{resource} is owned by '{owner}'")
            }
            Self::QueueFull(event) => write!(f, "event queue full, dropped '{event}'"),
            Self::Allocation(what) => write!(f, "out of capacity: {what}"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The dot-notation key does not exist.
    Missing(String),
    /// The key exists but holds a different JSON type.
    TypeMismatch(String),
    /// The document is not valid JSON.
    Parse(String),
    /// The value is present and well-typed but semantically invalid.
    Invalid(String),
    /// The backing store could not be read or written.
    Storage(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing key '{key}'"),
            Self::TypeMismatch(key) => write!(f, "wrong type at '{key}'"),
            Self::Parse(reason) => write!(f, "parse error: {reason}"),
            Self::Invalid(reason) => write!(f, "invalid: {reason}"),
            Self::Storage(reason) => write!(f, "storage: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Kernel-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
