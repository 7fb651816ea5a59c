//! Durable store gateway.
//!
//! Provides the SeaORM connection pool, error classification into the three
//! policy kinds callers care about, and the advisory-lock primitive used to
//! serialize scheduler selection across worker replicas.

use std::time::Duration;

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, SqlErr,
    Statement, Value,
};
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

use crate::config::AppConfig;

/// Lock class shared by every advisory key the service takes.
pub const ADVISORY_LOCK_CLASS: i32 = 0x4a42;

/// Serializes the job scheduler's selection-and-transition step.
pub const LOCK_KEY_JOB_SCHEDULING: i32 = 1;
/// Serializes consumption of unprocessed bound events.
pub const LOCK_KEY_EVENT_PROCESSING: i32 = 2;
/// Serializes periodic subscription refresh.
pub const LOCK_KEY_SUBSCRIPTION_REFRESH: i32 = 3;

/// Store failures classified by the policy callers should apply.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is temporarily unreachable; retry on the next tick.
    #[error("transient connectivity failure: {0}")]
    TransientConnectivity(#[source] DbErr),
    /// A concurrent writer won a guarded transition; roll back and move on.
    #[error("conflicting concurrent update: {0}")]
    ConflictRetryable(String),
    /// Invariant violation or programming error; do not retry.
    #[error("store failure: {0}")]
    Fatal(#[source] DbErr),
}

impl StoreError {
    /// Classifies a raw SeaORM error into a retry policy.
    pub fn from_db_err(err: DbErr) -> Self {
        match &err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => Self::TransientConnectivity(err),
            _ => match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(detail)) => {
                    Self::ConflictRetryable(detail.to_string())
                }
                _ => Self::Fatal(err),
            },
        }
    }
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        Self::from_db_err(err)
    }
}

/// Outcome of a non-blocking advisory lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryLock {
    /// The caller holds the lock until the surrounding transaction ends.
    Held,
    /// Another session holds the lock.
    Blocked,
}

/// Takes a transaction-scoped advisory lock, blocking until it is granted.
///
/// Only meaningful on Postgres; other backends run single-deployment test
/// harnesses where the row-status guard alone is sufficient.
pub async fn take_advisory_lock<C: ConnectionTrait>(
    conn: &C,
    class: i32,
    key: i32,
) -> Result<(), StoreError> {
    if conn.get_database_backend() != DatabaseBackend::Postgres {
        return Ok(());
    }

    conn.execute(Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT pg_advisory_xact_lock($1, $2)",
        vec![Value::Int(Some(class)), Value::Int(Some(key))],
    ))
    .await?;

    Ok(())
}

/// Attempts a transaction-scoped advisory lock without blocking.
pub async fn try_advisory_lock<C: ConnectionTrait>(
    conn: &C,
    class: i32,
    key: i32,
) -> Result<AdvisoryLock, StoreError> {
    if conn.get_database_backend() != DatabaseBackend::Postgres {
        return Ok(AdvisoryLock::Held);
    }

    let row = conn
        .query_one(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_try_advisory_xact_lock($1, $2) AS held",
            vec![Value::Int(Some(class)), Value::Int(Some(key))],
        ))
        .await?
        .ok_or_else(|| StoreError::Fatal(DbErr::Custom("advisory lock query returned no row".to_string())))?;

    let held: bool = row.try_get("", "held").map_err(StoreError::from_db_err)?;

    Ok(if held {
        AdvisoryLock::Held
    } else {
        AdvisoryLock::Blocked
    })
}

/// Initializes the database connection pool, retrying transient connect
/// failures with exponential backoff and creating the database on first run
/// for Postgres URLs.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection, StoreError> {
    if cfg.database_url.is_empty() {
        return Err(StoreError::Fatal(DbErr::Custom(
            "database URL cannot be empty".to_string(),
        )));
    }

    let mut opt = ConnectOptions::new(&cfg.database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let max_retries = 5;
    let mut retry_delay = Duration::from_millis(100);
    let mut database_ready = false;

    for attempt in 1..=max_retries {
        if !database_ready {
            match create_database_if_missing(&cfg.database_url, cfg.db_acquire_timeout_ms).await {
                Ok(()) => database_ready = true,
                Err(err) => {
                    if matches!(err, StoreError::Fatal(_)) || attempt == max_retries {
                        tracing::error!(
                            attempts = attempt,
                            error = %err,
                            "failed to prepare database"
                        );
                        return Err(err);
                    }

                    tracing::warn!(
                        attempt,
                        error = %err,
                        retry_in = ?retry_delay,
                        "database preparation failed, retrying"
                    );

                    sleep(retry_delay).await;
                    retry_delay *= 2;
                    continue;
                }
            }
        }

        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                tracing::info!(attempt, "connected to database");
                return Ok(conn);
            }
            Err(err) => {
                if attempt == max_retries {
                    tracing::error!(attempts = max_retries, error = %err, "failed to connect to database");
                    return Err(StoreError::TransientConnectivity(err));
                }

                tracing::warn!(
                    attempt,
                    error = %err,
                    retry_in = ?retry_delay,
                    "database connection failed, retrying"
                );

                sleep(retry_delay).await;
                retry_delay *= 2;
            }
        }
    }

    Err(StoreError::Fatal(DbErr::Custom(
        "database connection retries exhausted".to_string(),
    )))
}

/// Health check for the database connection.
pub async fn health_check(db: &DatabaseConnection) -> Result<(), StoreError> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt).await?;
    Ok(())
}

/// Creates the database named by a Postgres URL when it does not exist yet,
/// for first runs of local profiles.
///
/// Postgres has no `CREATE DATABASE IF NOT EXISTS`, so instead of probing
/// the catalog first the statement is issued unconditionally and a
/// duplicate-database failure counts as success. That also makes concurrent
/// first-start workers race-free: whoever loses the creation race lands in
/// the duplicate branch.
async fn create_database_if_missing(
    database_url: &str,
    acquire_timeout_ms: u64,
) -> Result<(), StoreError> {
    let Some(target) = AdminTarget::from_url(database_url)? else {
        // Nothing to prepare for non-Postgres URLs (tests run on SQLite).
        return Ok(());
    };

    let mut options = ConnectOptions::new(&target.admin_url);
    options
        .max_connections(1)
        .acquire_timeout(Duration::from_millis(acquire_timeout_ms))
        .sqlx_logging(false);

    let admin = Database::connect(options)
        .await
        .map_err(StoreError::TransientConnectivity)?;

    let create = admin
        .execute(Statement::from_string(
            DatabaseBackend::Postgres,
            format!("CREATE DATABASE {}", quote_identifier(&target.database)),
        ))
        .await;

    let outcome = match create {
        Ok(_) => {
            tracing::info!(database = %target.database, "created database");
            Ok(())
        }
        Err(err) if is_duplicate_database(&err) => Ok(()),
        Err(err) => Err(StoreError::TransientConnectivity(err)),
    };

    let _ = admin.close().await;

    outcome
}

/// The maintenance endpoint of a Postgres URL together with the database it
/// names.
struct AdminTarget {
    admin_url: String,
    database: String,
}

impl AdminTarget {
    /// Returns `None` for URLs that are not Postgres at all; errors when a
    /// Postgres URL carries no usable database name.
    fn from_url(database_url: &str) -> Result<Option<Self>, StoreError> {
        let url = Url::parse(database_url).map_err(|error| {
            StoreError::Fatal(DbErr::Custom(format!("invalid database URL: {error}")))
        })?;

        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Ok(None);
        }

        let database = extract_database_name(&url).ok_or_else(|| {
            StoreError::Fatal(DbErr::Custom(
                "database URL must specify a single database name segment".to_string(),
            ))
        })?;

        let mut admin_url = url;
        admin_url.set_path("/postgres");
        admin_url.set_query(None);
        admin_url.set_fragment(None);

        Ok(Some(Self {
            admin_url: admin_url.into(),
            database,
        }))
    }
}

/// SQLSTATE 42P04 is duplicate_database; older drivers only surface the
/// message text.
fn is_duplicate_database(err: &DbErr) -> bool {
    let text = err.to_string();
    text.contains("42P04") || text.contains("already exists")
}

fn extract_database_name(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    let name = segments.next()?;

    if name.is_empty() || segments.next().is_some() {
        return None;
    }

    Some(name.to_string())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_database_url_is_rejected() {
        let config = AppConfig {
            database_url: "".to_string(),
            ..Default::default()
        };

        let result = init_pool(&config).await;
        assert!(matches!(result, Err(StoreError::Fatal(_))));
    }

    #[tokio::test]
    async fn advisory_lock_degrades_on_sqlite() {
        let db = Database::connect("sqlite::memory:").await.unwrap();

        take_advisory_lock(&db, ADVISORY_LOCK_CLASS, LOCK_KEY_JOB_SCHEDULING)
            .await
            .unwrap();
        let outcome = try_advisory_lock(&db, ADVISORY_LOCK_CLASS, LOCK_KEY_JOB_SCHEDULING)
            .await
            .unwrap();
        assert_eq!(outcome, AdvisoryLock::Held);
    }

    #[test]
    fn classifies_connection_errors_as_transient() {
        let err = DbErr::Conn(sea_orm::RuntimeErr::Internal("refused".to_string()));
        assert!(matches!(
            StoreError::from_db_err(err),
            StoreError::TransientConnectivity(_)
        ));
    }

    #[test]
    fn classifies_unknown_errors_as_fatal() {
        let err = DbErr::Custom("broken invariant".to_string());
        assert!(matches!(StoreError::from_db_err(err), StoreError::Fatal(_)));
    }

    #[test]
    fn database_name_extraction() {
        let url = Url::parse("postgresql://user:pw@localhost:5432/jobline").unwrap();
        assert_eq!(extract_database_name(&url).as_deref(), Some("jobline"));

        let no_name = Url::parse("postgresql://localhost:5432").unwrap();
        assert_eq!(extract_database_name(&no_name), None);

        let empty = Url::parse("postgresql://localhost:5432/").unwrap();
        assert_eq!(extract_database_name(&empty), None);

        let nested = Url::parse("postgresql://localhost:5432/a/b").unwrap();
        assert_eq!(extract_database_name(&nested), None);
    }

    #[test]
    fn identifier_quoting_escapes_embedded_quotes() {
        assert_eq!(quote_identifier("jobline"), "\"jobline\"");
        assert_eq!(quote_identifier("job\"line"), "\"job\"\"line\"");
    }

    #[test]
    fn admin_target_points_at_the_maintenance_database() {
        let target = AdminTarget::from_url("postgresql://user:pw@db:5432/jobline?sslmode=disable")
            .unwrap()
            .expect("postgres URLs have an admin target");

        assert_eq!(target.database, "jobline");
        assert_eq!(target.admin_url, "postgresql://user:pw@db:5432/postgres");
    }

    #[test]
    fn admin_target_skips_non_postgres_urls() {
        let target = AdminTarget::from_url("sqlite::memory:").unwrap();
        assert!(target.is_none());
    }

    #[test]
    fn admin_target_requires_a_database_name() {
        let result = AdminTarget::from_url("postgresql://db:5432/");
        assert!(matches!(result, Err(StoreError::Fatal(_))));
    }

    #[test]
    fn duplicate_database_errors_are_recognised() {
        let by_code = DbErr::Custom("error returned from database: 42P04".to_string());
        assert!(is_duplicate_database(&by_code));

        let by_message =
            DbErr::Custom("database \"jobline\" already exists".to_string());
        assert!(is_duplicate_database(&by_message));

        let unrelated = DbErr::Custom("connection refused".to_string());
        assert!(!is_duplicate_database(&unrelated));
    }
}
