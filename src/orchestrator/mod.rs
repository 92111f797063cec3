//! Stage orchestration modules.
//!
//! Covers process launching, readiness probing, stage ordering, stale
//! path cleanup and termination, and child exit monitoring.

pub mod child_monitor;
pub mod cleanup;
pub mod codec;
pub mod controller;
pub mod launcher;
pub mod prober;
pub mod supervisor;
