//! Local IPC layer for `stagehand stop` and `stagehand status`.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands, the matching blocking client,
//! and the shared-secret token both sides use.

pub mod auth;
pub mod client;
pub mod server;
