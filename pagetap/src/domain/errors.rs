//! Structured error types for pagetap
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Lookup misses and capacity drops are outcomes, not errors, and never
//! appear here.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Lifecycle stage that produced an [`AttachmentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Open,
    Load,
    Attach,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Open => "open",
            Stage::Load => "load",
            Stage::Attach => "attach",
        })
    }
}

/// Open/load/attach failure. Fatal to startup.
#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("open failed: {0}")]
    OpenFailed(String),

    #[error("load failed for {probe}: {error}")]
    LoadFailed { probe: String, error: String },

    #[error("attach failed for {probe} ({target}): {error}")]
    AttachFailed { probe: String, target: String, error: String },

    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: &'static str },
}

impl AttachmentError {
    /// Stage to report in the top-level diagnostic.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            AttachmentError::OpenFailed(_) => Stage::Open,
            AttachmentError::LoadFailed { .. } => Stage::Load,
            AttachmentError::AttachFailed { .. } => Stage::Attach,
            AttachmentError::InvalidTransition { action, .. } => match *action {
                "load" => Stage::Load,
                "attach" => Stage::Attach,
                _ => Stage::Open,
            },
        }
    }
}

/// Consumer construction or poll failure. Fatal to the consumer thread only.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("{0} map not found")]
    MapNotFound(&'static str),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("cannot open {}: {source}", path.display())]
    Open { path: PathBuf, source: std::io::Error },

    #[error("channel disconnected")]
    Disconnected,
}

/// Malformed ring buffer record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record of {len} bytes is shorter than the {expected}-byte header")]
    Truncated { len: usize, expected: usize },

    #[error("unknown event kind {0}")]
    UnknownKind(u8),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
