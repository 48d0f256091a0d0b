//! Database connection and initialization.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub async fn clear_all(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM notifications").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM telemetry").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM routes").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM order_status_history").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM delivery_orders").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM zones").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM drones").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Initialize the SQLite database: create the file if missing, run migrations.
pub async fn init_database(db_path: &str, max_connections: u32) -> Result<Database> {
    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let db_url = if db_path == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{}?mode=rwc", db_path)
    };

    info!("Connecting to database: {}", db_path);

    let pool = SqlitePoolOptions::new().max_connections(max_connections).connect(&db_url).await?;

    run_migrations(&pool).await?;

    Ok(Database { pool })
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let migration_sql = include_str!("../../migrations/001_init.sql");

    info!("Running database migrations...");

    for statement in migration_sql.split(';') {
        let statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }

        if let Err(e) = sqlx::query(statement).execute(pool).await {
            let err_str = e.to_string();
            if err_str.contains("already exists") {
                continue;
            }
            if statement.to_uppercase().starts_with("CREATE") {
                anyhow::bail!("Migration failed on CREATE statement: {}", e);
            }
            warn!("Migration statement failed: {}", e);
        }
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_database() {
        let db = init_database(":memory:", 1).await.unwrap();

        let result: (i32,) = sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='drones'")
            .fetch_one(db.pool())
            .await
            .unwrap();

        assert_eq!(result.0, 1);
    }
}
