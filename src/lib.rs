#![forbid(unsafe_code)]

//! `stagehand`: ordered process supervisor with readiness probing.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod pidfile;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
