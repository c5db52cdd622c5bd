//! # tlsprobe - Dynamic Go TLS Instrumentation
//!
//! tlsprobe keeps eBPF uprobes attached to the `crypto/tls` read, write and
//! close functions of every Go binary running on the host, so that plaintext
//! TLS traffic can be observed without touching the applications. Processes
//! come and go; hooks follow them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Process Event Source (/proc poller)             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ exec(pid) / exit(pid)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Instrumentation Manager                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │   Identity   │──▶│   Negative   │──▶│   Binary     │        │
//! │  │   Resolver   │   │    Cache     │   │  Registry    │        │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘        │
//! │                                               │ first process  │
//! │                                               ▼                │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │    Hooks     │◀──│   Offsets    │◀──│   Analysis   │        │
//! │  │  (uprobes)   │   │  (eBPF map)  │   │ (ELF/DWARF)  │        │
//! │  └──────────────┘   └──────────────┘   └──────────────┘        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uprobes + OFFSETS_DATA
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 eBPF Programs (Kernel, prebuilt)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`manager`]: orchestration of process start/exit, reconciliation and shutdown
//! - [`registry`]: reference-counted binary registry with generations
//! - [`process_lookup`]: pid to `(dev, inode)` identity, self-instrumentation filter
//! - [`cache`]: bounded LRU of binaries known to be non-instrumentable
//! - [`analysis`]: Go build info, symbol, return site and DWARF struct layout extraction
//! - [`hooks`]: probe table, transactional attachment and the aya backend
//! - [`offsets`]: per-binary struct layouts published to the eBPF side
//! - [`events`]: process lifecycle notifications
//! - [`config`], [`cli`], [`preflight`]: runtime configuration and startup checks
//! - [`domain`]: core newtypes and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Hook every Go binary on the host
//! sudo ./tlsprobe --ebpf-object target/bpfel-unknown-none/release/tlsprobe
//!
//! # Only poll once a second, verbose logs
//! sudo ./tlsprobe --ebpf-object tlsprobe.o --poll-interval 1000 -v
//! ```
//!
//! ## Key Concepts
//!
//! - **Binary identity**: `(device, inode)` of the executable, stable across mount namespaces
//! - **Generation**: one lifetime of a registry entry, from its first process to its last
//! - **Return sites**: Go moves goroutine stacks, so returns are hooked with plain uprobes
//!   on every `ret` instruction instead of uretprobes

pub mod analysis;
pub mod cache;
pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod hooks;
pub mod manager;
pub mod offsets;
pub mod preflight;
pub mod process_lookup;
pub mod registry;
