//! Household chore scheduling with an offline-first family store and
//! best-effort reconciliation against a shared remote store.

pub mod application;
pub mod domain;
pub mod infrastructure;

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Injectable clock shared by the store, reconciler and ticker.
pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub use application::commands::{AppState, MutationResult, SyncStatus};
