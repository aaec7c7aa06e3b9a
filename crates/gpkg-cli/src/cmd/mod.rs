//! Subcommand implementations

pub mod create;
pub mod extract;
pub mod metadata;
pub mod update_metadata;
pub mod verify;
