//! AIDIS CLI Library Crate
//!
//! Configuration, startup wiring and the interactive loop for the `aidis`
//! binary, which is a thin wrapper around this library.

pub mod config;
pub mod repl;
pub mod state;
