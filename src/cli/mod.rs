// CLI module
//
// This module contains the command surface for the ledger

pub mod commands;

// Re-export main components for easier access
pub use commands::run_cli;
