//! Domain model for pagetap
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Decoded events from the kernel ring buffer
//! - Structured error handling

pub mod errors;
pub mod event;
pub mod types;

// Re-export common types for convenience
pub use event::{Event, EventKind, Status};
pub use types::{Pid, Tid};

pub use errors::{AttachmentError, ChannelError, DecodeError, ExportError, Stage};
