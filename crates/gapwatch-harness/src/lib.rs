//! Reboot-disruption test orchestration.
//!
//! - **state** — the per-plane reachability state machines
//! - **watcher** — the background probe loop classifying both planes
//! - **sendsniff** — the paced stream sender and its capture companion
//! - **ssh** — one-shot switch commands and interactive neighbor shells
//! - **neighbor** — per-neighbor LACP/BGP observation and log scraping
//! - **orchestrator** — the end-to-end reboot sequence and verdicts

pub mod neighbor;
pub mod orchestrator;
pub mod sendsniff;
pub mod ssh;
pub mod state;
pub mod watcher;
