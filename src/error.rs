//! Error types for the early-boot init shim.

use std::path::PathBuf;
use thiserror::Error;

use crate::handoff::HandoffError;
use crate::lifecycle::LifecycleState;
use crate::mount::{MountError, NodeError};

/// Result type alias for init shim operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init shim.
#[derive(Error, Debug)]
pub enum Error {
    /// Mount error
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Device node error
    #[error(transparent)]
    DeviceNode(#[from] NodeError),

    /// Handoff target or candidate error
    #[error(transparent)]
    Handoff(#[from] HandoffError),

    /// No console could be bound
    #[error("No console device available (tried {0:?})")]
    ConsoleUnavailable(Vec<PathBuf>),

    /// Signal error
    #[error("Signal error: {0}")]
    SignalError(String),

    /// Lifecycle transition that skips or reverses a state
    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

/// Process exit statuses.
pub struct ExitCode;

impl ExitCode {
    /// Normal shutdown after a termination signal
    pub const OK: i32 = 0;
    /// Generic unrecoverable startup failure
    pub const FAILURE: i32 = 1;
    /// Real init target missing and could not be repaired
    pub const TARGET_UNAVAILABLE: i32 = 126;
    /// Every handoff candidate failed to exec
    pub const EXHAUSTED: i32 = 127;
}
