//! SQLite layer shared by the sink and profile store: pool and schema.

use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

/// Connection pool type shared by the sink and the profile store.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    let conn = pool.get()?;
    migrate(&conn)?;

    Ok(pool)
}

/// In-memory pool for tests.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    migrate(&conn)?;
    Ok(pool)
}

/// Create tables and indexes if they do not exist yet.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
             id            TEXT PRIMARY KEY,
             event_type    TEXT NOT NULL,
             repo_name     TEXT NOT NULL,
             actor_login   TEXT NOT NULL,
             created_at    TEXT NOT NULL,
             payload       TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_events_repo_time ON events(repo_name, created_at);
         CREATE INDEX IF NOT EXISTS idx_events_type_time ON events(event_type, created_at);

         CREATE TABLE IF NOT EXISTS anomalies (
             event_id                     TEXT PRIMARY KEY,
             repository_name              TEXT NOT NULL,
             user_login                   TEXT NOT NULL,
             event_type                   TEXT NOT NULL,
             event_timestamp              TEXT NOT NULL,
             behavioral_anomaly_score     REAL NOT NULL,
             content_risk_score           REAL NOT NULL,
             temporal_anomaly_score       REAL NOT NULL,
             repository_criticality_score REAL NOT NULL,
             final_anomaly_score          REAL NOT NULL,
             severity_level               TEXT NOT NULL,
             primary_method               TEXT NOT NULL,
             behavioral_analysis          TEXT,
             content_analysis             TEXT,
             temporal_analysis            TEXT,
             repository_context           TEXT,
             high_risk_indicators         TEXT,
             ai_summary                   TEXT,
             detection_timestamp          TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_anomalies_severity_time
             ON anomalies(severity_level, detection_timestamp);
         CREATE INDEX IF NOT EXISTS idx_anomalies_user_time
             ON anomalies(user_login, detection_timestamp);

         CREATE TABLE IF NOT EXISTS temporal_patterns (
             id                TEXT PRIMARY KEY,
             event_id          TEXT NOT NULL,
             pattern_type      TEXT NOT NULL,
             severity          REAL NOT NULL,
             start_time        TEXT NOT NULL,
             duration_minutes  INTEGER NOT NULL,
             event_count       INTEGER NOT NULL,
             actor_count       INTEGER,
             events_per_minute REAL,
             p_value           REAL
         );
         CREATE INDEX IF NOT EXISTS idx_patterns_event ON temporal_patterns(event_id);

         CREATE TABLE IF NOT EXISTS profiles (
             key        TEXT PRIMARY KEY,
             value      TEXT NOT NULL,
             updated_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_profiles_updated ON profiles(updated_at);",
    )?;
    Ok(())
}
