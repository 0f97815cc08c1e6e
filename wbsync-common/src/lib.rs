//! # wbsync Common Library
//!
//! Shared code for the wbsync workspace:
//! - Error and result types
//! - Bootstrap configuration (TOML file, environment, compiled defaults)
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod time;

pub use error::{Error, Result};
