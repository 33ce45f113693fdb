//! Shared types for the gapwatch harness.
//!
//! This crate contains:
//! - **Config** — the immutable test configuration and the port-map files
//! - **Report** — verdict accumulator, per-neighbor reports, final rendering
//! - **Netmath** — IPv4 host arithmetic used to synthesize probe addresses

pub mod config;
pub mod netmath;
pub mod report;
