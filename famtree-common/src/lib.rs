//! # famtree Common Library
//!
//! Shared code for famtree services including:
//! - Error types
//! - Configuration loading (root folder, TOML config file)
//! - Event types and the broadcast event bus
//! - Family-tree database initialization

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
