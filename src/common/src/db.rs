//! Database connection and health-check helpers.

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::HarnessConfig;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),
}

/// Pooled Postgres connection, shared across every monitor in the process.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool. A failure here is fatal (error class (e) in the
    /// error-handling design) and should abort the process before any
    /// asset manager is spawned.
    pub async fn connect(config: &HarnessConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.data.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_and_health_checks_against_a_live_database() {
        dotenvy::dotenv().ok();
        let config = match HarnessConfig::from_env() {
            Ok(c) => c,
            Err(_) => return, // no DATABASE_URL configured in this environment
        };

        let db = Database::connect(&config).await;
        assert!(db.is_ok(), "should connect to database");

        let db = db.unwrap();
        assert!(db.health_check().await.is_ok(), "health check should pass");
    }
}
