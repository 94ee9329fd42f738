//! # pagetap - eBPF Page Fault Interception
//!
//! pagetap hooks the kernel page fault handler, picks out faults of selected
//! processes, and for each completed fault reads the faulting page from the
//! target's memory, transforms it and writes it back. Every step is reported
//! as a structured record.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Target Process                             │
//! │               (touches a page → page fault)                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ handle_mm_fault
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   eBPF Programs (Kernel)                        │
//! │  • kprobe fault_entry:  filter → record {thread: address}       │
//! │  • kretprobe fault_exit: match → read → transform → write page  │
//! │  • uprobe/uretprobe call_site_{entry,exit} (optional)           │
//! └──────────────┬─────────────────────────────┬────────────────────┘
//!                │ EVENTS ring buffer           │ trace_pipe (bpf_printk)
//!                ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     pagetap (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Orchestrator │   │   Stream     │──▶│    Event     │         │
//! │  │ open → load  │   │  Consumers   │   │  Processor   │         │
//! │  │ → attach     │   │ (1 / channel)│   └──────┬───────┘         │
//! │  └──────────────┘   └──────────────┘          │ lossy ring      │
//! │                                               ▼                 │
//! │                                        ┌──────────────┐         │
//! │                                        │ JSON export  │         │
//! │                                        └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`probes`]: probe declarations, the aya backend, and the lifecycle
//!   state machine (`Unloaded → Opened → Loaded → Attached → Destroyed`)
//! - [`channel`]: the kernel ring buffer, an in-process lossy ring, and the
//!   trace pipe reader, all behind [`channel::RecordSource`]
//! - [`consumer`]: the polling thread, event decoding, rendering and pairing
//! - [`export`]: JSON-lines output
//! - [`domain`]: decoded events, typed ids and error types
//! - [`cli`], [`preflight`]: argument parsing and environment checks
//!
//! Filtering, correlation and the page transform live in `pagetap-common` so
//! the kernel programs and the host tests share one implementation.
//!
//! ## Typical Usage
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! sudo ./target/release/pagetap --comm reader --dump-pages
//! ```
//!
//! ## Caveat
//!
//! The read → transform → write sequence is not atomic with respect to the
//! target. A store by another target thread between the read and the write
//! is overwritten.

pub mod channel;
pub mod cli;
pub mod consumer;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod probes;
