use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use assetso_lifecycle_core::{
    EngineError, EngineKind, Row, StorageEngine, TableSpec, UnitOfWork,
};
use rusqlite::{Connection, OpenFlags};

use crate::sql::{self, ColumnPolicy, SqlWriter};

/// Relational engine pinned to one dedicated `SQLite` connection.
///
/// Rows are read and written exactly as stored; column names come from the rows themselves.
pub struct DirectEngine {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl DirectEngine {
    /// Connect to an existing database file. A missing file is a connection failure so the
    /// selector can move on to the next engine.
    ///
    /// # Errors
    /// Returns `ConnectionFailed` when the file cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|err| {
            EngineError::connection_failed(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;
        crate::apply_connection_pragmas(&conn).map_err(|err| sql::classify(&err))?;

        tracing::debug!(engine = %EngineKind::Direct, path = %path.display(), "opened connection");
        Ok(Self { path: path.to_path_buf(), conn: Mutex::new(conn) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn.lock().map_err(|_| EngineError::other("direct engine connection lock poisoned"))
    }
}

impl StorageEngine for DirectEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Direct
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn read(&self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        let conn = self.connection()?;
        sql::read_rows(&conn, table, ColumnPolicy::AsProvided)
    }

    fn unit_of_work(&self, work: &mut UnitOfWork<'_>) -> Result<(), EngineError> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction().map_err(|err| sql::classify(&err))?;
        {
            let mut writer = SqlWriter::new(&tx, ColumnPolicy::AsProvided);
            work(&mut writer)?;
        }
        tx.commit().map_err(|err| sql::classify(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{migrated_db, row};
    use anyhow::Result;
    use assetso_lifecycle_core::{
        table_spec, DeleteFilter, EngineErrorKind, TableWriter, Upsert, ASSETS, CATEGORIES, LOGS,
        USERS,
    };
    use serde_json::json;

    fn spec(name: &str) -> &'static TableSpec {
        match table_spec(name) {
            Some(spec) => spec,
            None => panic!("{name} must be in the catalog"),
        }
    }

    #[test]
    fn missing_database_file_is_a_connection_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = match DirectEngine::open(&dir.path().join("absent.db")) {
            Ok(_) => panic!("open must fail for a missing file"),
            Err(err) => err,
        };
        assert_eq!(err.kind, EngineErrorKind::ConnectionFailed);
        Ok(())
    }

    #[test]
    fn upsert_then_read_orders_by_natural_key() -> Result<()> {
        let (_dir, path) = migrated_db()?;
        let engine = DirectEngine::open(&path)?;
        let rows = vec![
            row(json!({"id": "c2", "name": "Vehicles", "created_at": "t", "updated_at": "t"})),
            row(json!({"id": "c1", "name": "Laptops", "created_at": "t", "updated_at": "t"})),
        ];

        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(CATEGORIES), &rows)).map(|_| ())
        })?;

        let read = engine.read(spec(CATEGORIES))?;
        let ids = read.iter().filter_map(|r| r.get("id").and_then(|v| v.as_str())).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(read[0].get("description"), Some(&json!(null)));
        Ok(())
    }

    #[test]
    fn failed_unit_of_work_rolls_back_every_write() -> Result<()> {
        let (_dir, path) = migrated_db()?;
        let engine = DirectEngine::open(&path)?;
        let categories =
            vec![row(json!({"id": "c1", "name": "Laptops", "created_at": "t", "updated_at": "t"}))];
        let orphan_asset = vec![row(json!({
            "id": "a1", "code": "A-1", "name": "ThinkPad", "category_id": "missing",
            "created_at": "t", "updated_at": "t"
        }))];

        let result = engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(CATEGORIES), &categories))?;
            writer.write_batch(&Upsert::by_natural_key(spec(ASSETS), &orphan_asset))?;
            Ok(())
        });

        let err = match result {
            Ok(()) => panic!("foreign key violation must fail the unit of work"),
            Err(err) => err,
        };
        assert_eq!(err.kind, EngineErrorKind::ConstraintViolation);
        assert!(engine.read(spec(CATEGORIES))?.is_empty());
        Ok(())
    }

    #[test]
    fn reupserting_a_user_by_email_updates_in_place() -> Result<()> {
        let (_dir, path) = migrated_db()?;
        let engine = DirectEngine::open(&path)?;
        let first = vec![row(json!({
            "id": "u1", "email": "ops@assetso.com", "password": "x", "role": "STAFF",
            "created_at": "t", "updated_at": "t"
        }))];
        let second = vec![row(json!({
            "id": "u1", "email": "ops@assetso.com", "password": "y", "role": "MANAGER",
            "created_at": "t", "updated_at": "t2"
        }))];

        for rows in [&first, &second] {
            engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
                writer.write_batch(&Upsert::by_natural_key(spec(USERS), rows)).map(|_| ())
            })?;
        }

        let users = engine.read(spec(USERS))?;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].get("role"), Some(&json!("MANAGER")));
        Ok(())
    }

    #[test]
    fn user_upsert_keeps_a_referenced_target_id() -> Result<()> {
        let (_dir, path) = migrated_db()?;
        let engine = DirectEngine::open(&path)?;
        let reseeded = vec![row(json!({
            "id": "reseeded", "email": "admin@assetso.com", "password": "x", "role": "ADMIN",
            "created_at": "t0", "updated_at": "t0"
        }))];
        let login = vec![row(json!({
            "id": 1, "user_id": "reseeded", "action": "login", "created_at": "t0"
        }))];
        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(USERS), &reseeded))?;
            writer.write_batch(&Upsert::by_natural_key(spec(LOGS), &login))?;
            Ok(())
        })?;

        let archived = vec![row(json!({
            "id": "archived", "email": "admin@assetso.com", "password": "y", "role": "ADMIN",
            "created_at": "t1", "updated_at": "t1"
        }))];
        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(USERS), &archived)).map(|_| ())
        })?;

        let users = engine.read(spec(USERS))?;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].get("id"), Some(&json!("reseeded")));
        assert_eq!(users[0].get("created_at"), Some(&json!("t0")));
        assert_eq!(users[0].get("password"), Some(&json!("y")));
        Ok(())
    }

    #[test]
    fn not_equal_filter_keeps_matching_rows() -> Result<()> {
        let (_dir, path) = migrated_db()?;
        let engine = DirectEngine::open(&path)?;
        let users = vec![
            row(json!({"id": "u1", "email": "admin@assetso.com", "password": "x", "role": "ADMIN",
                       "created_at": "t", "updated_at": "t"})),
            row(json!({"id": "u2", "email": "staff@assetso.com", "password": "x", "role": "STAFF",
                       "created_at": "t", "updated_at": "t"})),
        ];
        let mut deleted = 0;
        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(USERS), &users))?;
            deleted = writer.delete_where(
                spec(USERS),
                &DeleteFilter::NotEqual { column: "role", value: "ADMIN".to_string() },
            )?;
            Ok(())
        })?;

        assert_eq!(deleted, 1);
        let remaining = engine.read(spec(USERS))?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get("email"), Some(&json!("admin@assetso.com")));
        Ok(())
    }
}
