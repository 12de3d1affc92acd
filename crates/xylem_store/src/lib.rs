//! Results storage for xylem.
//!
//! The crate resolves configuration into a [`ResultsManager`], which owns
//! one of two interchangeable backends: a locked YAML results file or a
//! SQLite database. Reports, retrievals, selections, removals and status
//! flags behave the same against either.

pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod lock;
pub mod manager;
pub mod reports;

pub use backend::db::DatabaseBackend;
pub use backend::file::FileBackend;
pub use backend::{
    RecentResult, RecordPage, RecordResults, ResultsBackend, SelectedRecord, TimeField,
};
pub use config::{ConfigFile, DatabaseConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use filter::{FilterCondition, FilterOp, FilterValue, JsonFilterCondition};
pub use lock::{FileLockGuard, LockError};
pub use manager::ResultsManager;
pub use reports::ResultFormatter;
