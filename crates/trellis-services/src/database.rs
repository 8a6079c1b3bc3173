//! # Database Connector
//!
//! PostgreSQL pool via `sqlx`. The handle's client is the pool itself;
//! `PgPool` is reference-counted so each request clones it cheaply.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use trellis_core::{Capability, DatabaseSettings};

use crate::error::BoxError;
use crate::handle::Connector;

/// Opens a PostgreSQL pool from [`DatabaseSettings`].
#[derive(Debug, Clone)]
pub struct DatabaseConnector {
    settings: DatabaseSettings,
    acquire_timeout: Duration,
}

impl DatabaseConnector {
    pub fn new(settings: DatabaseSettings, acquire_timeout: Duration) -> Self {
        Self {
            settings,
            acquire_timeout,
        }
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }
}

#[async_trait]
impl Connector for DatabaseConnector {
    type Client = PgPool;

    fn capability(&self) -> Capability {
        Capability::Database
    }

    async fn connect(&self) -> Result<PgPool, BoxError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.settings.url)
            .await?;
        Ok(pool)
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), BoxError> {
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok(())
    }

    async fn disconnect(&self, pool: PgPool) {
        pool.close().await;
    }
}
