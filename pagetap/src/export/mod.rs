//! Event export
//!
//! Writes one JSON object per event per line. The writer runs on its own
//! consumer thread fed by a lossy ring, so a slow disk drops export records
//! instead of stalling the kernel ring consumer.

pub mod jsonl;

pub use jsonl::{ExportRecord, JsonLinesWriter};
