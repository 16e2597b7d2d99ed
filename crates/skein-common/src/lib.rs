//! Shared primitives for the Skein filter graph engine.
//!
//! This crate contains:
//! - **Id generation** — auto-incrementing filter names and `$GINC` counters
//! - **Reservoir** — a slab-backed object pool used for per-filter packet
//!   buffers and the session's live-filter table
//! - **Logging** — the `tracing-subscriber` setup shared by every binary

pub mod ids;
pub mod logging;
pub mod reservoir;
