//! Persistence layer: schema bootstrap and typed accessors over a
//! relational store.
//!
//! All other components are stateless between cycles; this is the only
//! durable memory in the system. Every accessor returns [`DbError`], never
//! a raw [`sqlx::Error`].

pub mod chat;
pub mod kv;
pub mod reconcile;
pub mod token;
pub mod types;
pub mod vod;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::DbError;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Handle to the database pool. Cheap to clone; every component holds one.
#[derive(Clone, Debug)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connects to `dsn` and brings the schema up to date.
    ///
    /// # Errors
    ///
    /// If the connection cannot be established or the bootstrap migration
    /// fails.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Wraps an already-constructed pool, for callers that need custom pool
    /// options or that build a pool against a test database themselves.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<(), DbError> {
        for statement in MIGRATION_SQL.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
