//! Store error types.

use thiserror::Error;

const ACTIVE_USER_PROBLEM_CONSTRAINT: &str = "stacks_active_user_problem_uniq";
const ACTIVE_NODE_PORT_CONSTRAINT: &str = "stacks_active_node_port_uniq";
const UNIQUE_VIOLATION: &str = "23505";

/// Stack store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another active stack already exists for the same (user, problem).
    #[error("an active stack already exists for this user and problem")]
    DuplicateActiveStack,

    /// Another active stack already holds this node port.
    #[error("node port {0} is already held by an active stack")]
    NodePortTaken(u16),

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory found (tried {tried})")]
    MigrationDirNotFound { tried: String },
}

impl StoreError {
    /// Classify a failed insert, surfacing the partial unique indexes as
    /// domain errors.
    pub(crate) fn from_insert(err: sqlx::Error, node_port: u16) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                match db_err.constraint() {
                    Some(ACTIVE_USER_PROBLEM_CONSTRAINT) => return Self::DuplicateActiveStack,
                    Some(ACTIVE_NODE_PORT_CONSTRAINT) => return Self::NodePortTaken(node_port),
                    _ => {}
                }
            }
        }
        Self::Query(err)
    }
}
