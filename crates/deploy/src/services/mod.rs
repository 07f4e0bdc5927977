//! Containerized services backing the fork sandbox.
//!
//! Each service is in its own submodule with:
//! - `cmd.rs` - Command builder for generating Docker commands
//! - `mod.rs` - Backend and start logic

pub mod anvil;
