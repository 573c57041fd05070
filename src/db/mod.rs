//! Database connection pool, migrations, and health check.
//!
//! One Postgres instance backs both the work item store (`work`) and the
//! delivery queue (`pgmq`), sharing this pool.

pub mod pgmq;
pub mod work;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use pgmq::PgmqBroker;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// A pgmq broker on `queue` sharing this pool.
    pub fn broker(
        &self,
        queue: impl Into<String>,
        visibility_timeout: std::time::Duration,
    ) -> PgmqBroker {
        PgmqBroker::new(self.pool.clone(), queue, visibility_timeout)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
