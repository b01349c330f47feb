//! `powersearch` crate (library surface).
//!
//! The primary entrypoint is the `powersearch` binary (CLI + MCP stdio). This module lets
//! embedders reuse the core types without depending on the internal crate layout.

pub use powersearch_core as core;
