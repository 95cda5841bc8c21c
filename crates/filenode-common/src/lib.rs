//! Filenode Common - Shared types and utilities
//!
//! This crate provides the error type, configuration tree and the
//! identifiers (tenant keys, content ids, blocks) shared by every
//! filenode component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
