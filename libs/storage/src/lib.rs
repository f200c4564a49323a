//! Postgres repositories for every durable entity.
//!
//! One `Store` wraps the pool; method groups live in per-entity modules.
//! Queue-like tables (campaign recipients, webhook deliveries) are claimed
//! with `FOR UPDATE SKIP LOCKED` so additional workers scale horizontally
//! without double-processing. The schema the queries are written against is
//! documented in `schema.sql`.

use std::time::Duration;

use omc_core::{Error, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod automation;
pub mod campaigns;
pub mod contacts;
pub mod messages;
pub mod models;
pub mod orgs;
pub mod sessions;
pub mod transfers;
pub mod users;
pub mod webhooks;

pub use models::*;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|err| Error::internal("database connect failed").with_source(err))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Maps driver errors onto the shared kinds: unique violations become
/// `Conflict`, missing rows `NotFound`, everything else `Internal`.
pub(crate) fn db_err(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::not_found("not found").with_source(err),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            Error::conflict("row already exists").with_source(err)
        }
        _ => Error::internal("database error").with_source(err),
    }
}
