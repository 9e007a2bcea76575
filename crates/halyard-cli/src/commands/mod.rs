//! CLI command implementations.

pub mod dump;
pub mod redefine;
pub mod stress;
pub mod verify_archive;
