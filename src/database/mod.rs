//! Database connection and management module
//!
//! Connection pooling and configuration for the Postgres-backed stores.

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{info, warn};

mod secure_group_repository;

pub use secure_group_repository::PgSecureGroupStore;

/// Tables the engine expects in the `secure_groups` schema
const REQUIRED_TABLES: &[&str] = &[
    "secure_group",
    "group_filter",
    "group_chain_entry",
    "group_override",
    "membership",
    "membership_log",
    "notification",
    "membership_application",
    "character",
    "character_org_facts",
    "permission_group_member",
];

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/secure_groups".to_string()),
            max_connections: std::env::var("DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl DatabaseConfig {
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }
}

/// Database connection manager
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    pub async fn new(config: DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            "Connecting to database: {}",
            mask_database_url(&config.database_url)
        );

        let mut pool_options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);

        if let Some(idle_timeout) = config.idle_timeout {
            pool_options = pool_options.idle_timeout(idle_timeout);
        }

        if let Some(max_lifetime) = config.max_lifetime {
            pool_options = pool_options.max_lifetime(max_lifetime);
        }

        let pool = pool_options
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to database: {}", e);
                e
            })?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Store adapter sharing this manager's pool
    pub fn secure_group_store(&self) -> PgSecureGroupStore {
        PgSecureGroupStore::new(self.pool.clone())
    }

    /// Check that every table the engine reads or writes exists.
    pub async fn verify_schema(&self) -> Result<(), sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM information_schema.tables
            WHERE table_schema = 'secure_groups'
            AND table_name = ANY($1)
            "#,
        )
        .bind(REQUIRED_TABLES)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        if count < REQUIRED_TABLES.len() as i64 {
            warn!(
                found = count,
                expected = REQUIRED_TABLES.len(),
                "Secure group tables missing; apply migrations/001_secure_groups.sql"
            );
            return Err(sqlx::Error::Protocol(format!(
                "expected {} secure_groups tables, found {count}",
                REQUIRED_TABLES.len()
            )));
        }

        info!("Database schema verification complete");
        Ok(())
    }

    pub async fn close(self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

/// Mask the password in a database URL for logging
pub fn mask_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let mut masked = parsed.clone();
            if parsed.password().is_some() {
                let _ = masked.set_password(Some("***"));
            }
            masked.to_string()
        }
        Err(_) if url.len() > 20 => format!("{}***{}", &url[..10], &url[url.len() - 10..]),
        Err(_) => "***".to_string(),
    }
}
