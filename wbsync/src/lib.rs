//! wbsync library interface
//!
//! Incremental synchronization of indicator × country × year observations
//! from a paginated statistics API into a local SQLite store.

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{StoreError, SyncError, SyncResult};
pub use crate::models::{Observation, SyncOutcome};
pub use crate::services::Synchronizer;
