//! Persistence layer for stack records.
//!
//! This module provides:
//! - The [`StackStore`] interface the lifecycle service and reconciler use
//! - [`PgStackStore`], backed by Postgres through SQLx
//! - [`MemoryStackStore`], for development and tests
//! - Connection pool management and migrations
//!
//! Both stores enforce the same rule: at most one stack per
//! `(user_id, problem_id)` may be active (pending or running) at a time.

mod error;
mod memory;
mod stacks;

pub use error::StoreError;
pub use memory::MemoryStackStore;
pub use stacks::PgStackStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use stackd_id::StackId;
use std::{path::PathBuf, time::Duration};
use tracing::info;

use crate::stack::{Stack, StackStatus, StatusCounts};

/// Durable storage for stack records.
#[async_trait]
pub trait StackStore: Send + Sync {
    /// Persist a new record. Fails with `DuplicateActiveStack` if the record is
    /// active and another active record exists for its (user, problem).
    async fn insert(&self, stack: &Stack) -> Result<(), StoreError>;

    async fn get(&self, id: StackId) -> Result<Option<Stack>, StoreError>;

    /// All records except deleted ones, oldest first.
    async fn list_all(&self) -> Result<Vec<Stack>, StoreError>;

    /// A user's records except deleted ones, oldest first.
    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Stack>, StoreError>;

    /// Pending and running records, oldest first.
    async fn list_active(&self) -> Result<Vec<Stack>, StoreError>;

    async fn find_active(&self, user_id: i64, problem_id: i64) -> Result<Option<Stack>, StoreError>;

    async fn count_active_for_user(&self, user_id: i64) -> Result<u32, StoreError>;

    /// Compare-and-set status change.
    ///
    /// Moves the record to `to` only if its current status is one of `from`,
    /// returning the updated record. Returns `None` when the record is missing
    /// or another writer changed it first.
    async fn transition(
        &self,
        id: StackId,
        from: &[StackStatus],
        to: StackStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Stack>, StoreError>;

    /// Stamp `last_reconciled_at` on the given records.
    async fn mark_reconciled(&self, ids: &[StackId], at: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Remove terminal records last updated before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Pool settings for [`Database::connect`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long a query waits for a free connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/stackd".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared Postgres pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!(
            max_connections = config.max_connections,
            "Connected to stack database"
        );
        Ok(Self { pool })
    }

    /// Apply pending migrations.
    ///
    /// The binary may start from the workspace root or from the crate
    /// directory, so the first existing migrations directory wins.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let candidates = migration_dirs();
        let Some(dir) = candidates.iter().find(|dir| dir.is_dir()) else {
            let tried = candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StoreError::MigrationDirNotFound { tried });
        };

        let migrator = sqlx::migrate::Migrator::new(dir.clone())
            .await
            .map_err(StoreError::Migration)?;
        migrator
            .run(&self.pool)
            .await
            .map_err(StoreError::Migration)?;

        info!(dir = %dir.display(), "Stack migrations applied");
        Ok(())
    }

    pub fn stack_store(&self) -> PgStackStore {
        PgStackStore::new(self.pool.clone())
    }
}

fn migration_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("migrations"),
        PathBuf::from("services/stack-manager/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}
