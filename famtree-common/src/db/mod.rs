//! Database initialization for the family-tree store

pub mod init;

pub use init::*;
