use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod direct;
mod orm;
mod sql;

pub use direct::DirectEngine;
pub use orm::{Model, ModelRegistry, OrmEngine};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  name TEXT,
  password TEXT NOT NULL,
  role TEXT NOT NULL DEFAULT 'STAFF',
  department TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS departments (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  code TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sites (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  address TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assets (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  category_id TEXT REFERENCES categories(id),
  site_id TEXT REFERENCES sites(id),
  department_id TEXT REFERENCES departments(id),
  status TEXT NOT NULL DEFAULT 'AVAILABLE',
  image_url TEXT,
  purchase_date TEXT,
  price REAL,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS asset_checkouts (
  id TEXT PRIMARY KEY,
  asset_id TEXT NOT NULL REFERENCES assets(id),
  user_id TEXT NOT NULL REFERENCES users(id),
  checked_out_at TEXT NOT NULL,
  due_at TEXT,
  checked_in_at TEXT,
  notes TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_opname_sessions (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  site_id TEXT REFERENCES sites(id),
  status TEXT NOT NULL DEFAULT 'OPEN',
  started_by TEXT REFERENCES users(id),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_opname_entries (
  id TEXT PRIMARY KEY,
  session_id TEXT NOT NULL REFERENCES stock_opname_sessions(id),
  asset_id TEXT NOT NULL REFERENCES assets(id),
  scanned_by TEXT REFERENCES users(id),
  condition TEXT,
  found INTEGER NOT NULL DEFAULT 1 CHECK (found IN (0, 1)),
  notes TEXT,
  scanned_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
  id INTEGER PRIMARY KEY,
  user_id TEXT REFERENCES users(id),
  action TEXT NOT NULL,
  entity TEXT,
  entity_id TEXT,
  details TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_category ON assets(category_id);
CREATE INDEX IF NOT EXISTS idx_asset_checkouts_asset ON asset_checkouts(asset_id);
CREATE INDEX IF NOT EXISTS idx_stock_opname_entries_session ON stock_opname_entries(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
";

const CONNECTION_PRAGMAS_SQL: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    /// `sqlite://path` or `sqlite:path`.
    Sqlite,
    /// `file:path`, the ORM's local placeholder.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    pub scheme: UrlScheme,
    pub path: PathBuf,
}

impl DatabaseUrl {
    /// Parse a `DATABASE_URL` value. Returns `None` for schemes no local engine understands.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("sqlite:") {
            (UrlScheme::Sqlite, rest)
        } else if let Some(rest) = raw.strip_prefix("file:") {
            (UrlScheme::File, rest)
        } else {
            return None;
        };

        let path = rest.strip_prefix("//").unwrap_or(rest);
        let path = path.split('?').next().unwrap_or_default();
        if path.is_empty() {
            return None;
        }
        Some(Self { scheme, path: PathBuf::from(path) })
    }
}

pub(crate) fn apply_connection_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CONNECTION_PRAGMAS_SQL)
}

/// Report current and target schema versions plus pending migrations.
///
/// # Errors
/// Returns an error when schema metadata cannot be read or initialized.
pub fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

/// Apply all forward migrations up to the latest supported schema version.
///
/// # Errors
/// Returns an error when a migration step fails or the database is newer than this build.
pub fn migrate(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let version = current_schema_version(conn)?;
    if version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; this build supports up to {LATEST_SCHEMA_VERSION}"
        ));
    }

    if version < 1 {
        // Databases that predate the migrations table already carry the v1 tables.
        if table_exists(conn, "users")? && table_exists(conn, "assets")? {
            tracing::info!("adopting existing schema as version 1");
        } else {
            conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
        }
        record_schema_version(conn, 1)?;
    }

    schema_status(conn)
}

/// Open (creating if needed) the database at `path` and migrate it.
///
/// # Errors
/// Returns an error when the file cannot be opened or a migration fails.
pub fn migrate_path(path: &Path) -> Result<SchemaStatus> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")
        .context("failed to configure sqlite journal mode")?;
    apply_connection_pragmas(&conn).context("failed to configure sqlite pragmas")?;
    migrate(&conn)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_schemes_are_recognised() {
        assert_eq!(
            DatabaseUrl::parse("sqlite:///var/lib/assetso.db"),
            Some(DatabaseUrl { scheme: UrlScheme::Sqlite, path: PathBuf::from("/var/lib/assetso.db") })
        );
        assert_eq!(
            DatabaseUrl::parse("sqlite:data/app.db?mode=rwc"),
            Some(DatabaseUrl { scheme: UrlScheme::Sqlite, path: PathBuf::from("data/app.db") })
        );
        assert_eq!(
            DatabaseUrl::parse("file:./dev.db").map(|url| url.scheme),
            Some(UrlScheme::File)
        );
        assert_eq!(DatabaseUrl::parse("postgres://localhost/assetso"), None);
        assert_eq!(DatabaseUrl::parse("sqlite://"), None);
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let first = migrate(&conn)?;
        assert_eq!(first.current_version, LATEST_SCHEMA_VERSION);
        assert!(first.pending_versions.is_empty());

        let second = migrate(&conn)?;
        assert_eq!(second, first);
        for table in assetso_lifecycle_core::catalog() {
            assert!(table_exists(&conn, table.name)?, "{} must exist", table.name);
        }
        Ok(())
    }

    #[test]
    fn fresh_database_reports_pending_migration() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let status = schema_status(&conn)?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![1]);
        Ok(())
    }

    #[test]
    fn migrate_rejects_newer_schema() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        record_schema_version(&conn, LATEST_SCHEMA_VERSION + 1)?;
        assert!(migrate(&conn).is_err());
        Ok(())
    }
}
