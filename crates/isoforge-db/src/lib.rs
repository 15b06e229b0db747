//! Persistence layer for isoforge.
//!
//! Provides the build repository (Postgres and in-memory), the status channel
//! store, and artifact storage backends.

pub mod artifact;
pub mod error;
pub mod memory;
pub mod repo;

pub use artifact::FsArtifactStore;
pub use error::{DbError, DbResult};
pub use memory::{MemoryArtifactStore, MemoryBuildRepo, MemoryStatusChannel};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
