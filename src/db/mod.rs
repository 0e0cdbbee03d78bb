// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL access: connection pool, embedded migrations and the
//! transaction scope every batch commits through.

use anyhow::{anyhow, Context};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::error::{IndexerError, IndexerResult};

pub mod models;
pub mod repository;
pub mod schema;
pub mod stats;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const POOL_SIZE: u32 = 10;

/// Shared connection pool. Cloning shares the same pool across chain workers.
#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
}

impl Db {
    /// Build the pool and verify connectivity.
    pub async fn connect_pool(database_url: &str) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .await
            .context("failed to create database pool")?;

        // Fail startup early if the database is unreachable.
        pool.get().await.context("failed to connect to database")?;
        Ok(Self { pool })
    }

    pub async fn connect(&self) -> IndexerResult<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| IndexerError::Pool(e.to_string()))
    }

    /// Run `callback` inside a database transaction: committed when it
    /// returns `Ok`, rolled back on `Err` (or if the future is dropped).
    pub async fn transaction<'a, R, F>(&self, callback: F) -> IndexerResult<R>
    where
        F: for<'r> FnOnce(
                &'r mut AsyncPgConnection,
            ) -> ScopedBoxFuture<'a, 'r, IndexerResult<R>>
            + Send
            + 'a,
        R: Send + 'a,
    {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        conn.transaction(callback).await
    }

    /// Apply pending embedded migrations.
    pub async fn run_migrations(database_url: &str) -> anyhow::Result<()> {
        let conn = AsyncPgConnection::establish(database_url)
            .await
            .context("failed to connect for migrations")?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();

        let applied = tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(MIGRATIONS)
                .map(|versions| versions.len())
                .map_err(|e| anyhow!("failed to run migrations: {e}"))
        })
        .await
        .context("migration task panicked")??;

        if applied > 0 {
            info!(applied, "database migrations applied");
        }
        Ok(())
    }
}
