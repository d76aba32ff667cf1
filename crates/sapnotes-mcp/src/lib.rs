//! `sapnotes` crate (library surface).
//!
//! The primary entrypoint is the `sapnotes` binary (CLI + MCP stdio). This module lets
//! embedders reach the service without depending on the internal crate layout.

pub use sapnotes_core as core;
pub use sapnotes_local::{Config, NoteService};
