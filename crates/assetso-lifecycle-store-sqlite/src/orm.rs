use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use assetso_lifecycle_core::{
    catalog, DeleteFilter, EngineError, EngineKind, Row, StorageEngine, TableSpec, TableWriter,
    UnitOfWork, Upsert,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::sql::{self, ColumnPolicy, SqlWriter};

const DEFAULT_POOL_SIZE: u32 = 4;
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Mapped model for one table: the columns the ORM will read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub table: &'static TableSpec,
}

impl Model {
    #[must_use]
    pub fn columns(&self) -> &'static [&'static str] {
        self.table.columns
    }
}

/// Table name to model. Tables without a model are invisible to the ORM engine.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<&'static str, Model>,
}

impl ModelRegistry {
    #[must_use]
    pub fn from_catalog() -> Self {
        Self::from_tables(catalog())
    }

    #[must_use]
    pub fn from_tables(tables: &'static [TableSpec]) -> Self {
        let models = tables.iter().map(|table| (table.name, Model { table })).collect();
        Self { models }
    }

    #[must_use]
    pub fn model(&self, table: &str) -> Option<&Model> {
        self.models.get(table)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn require(&self, table: &TableSpec) -> Result<&Model, EngineError> {
        self.model(table.name)
            .ok_or_else(|| EngineError::not_found(format!("no model registered for {}", table.name)))
    }
}

/// Object-relational engine: pooled connections, model-filtered columns.
pub struct OrmEngine {
    pool: Pool<SqliteConnectionManager>,
    models: ModelRegistry,
}

impl OrmEngine {
    /// Build a connection pool over an existing database file.
    ///
    /// # Errors
    /// Returns `ConnectionFailed` when the pool cannot establish its first connection.
    pub fn open(path: &Path, models: ModelRegistry) -> Result<Self, EngineError> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI)
            .with_init(|conn| crate::apply_connection_pragmas(conn));
        let pool = Pool::builder()
            .max_size(DEFAULT_POOL_SIZE)
            .connection_timeout(CHECKOUT_TIMEOUT)
            .build(manager)
            .map_err(|err| {
                EngineError::connection_failed(format!(
                    "failed to build connection pool for {}: {err}",
                    path.display()
                ))
            })?;

        tracing::debug!(
            engine = %EngineKind::Orm,
            path = %path.display(),
            models = models.len(),
            "connection pool ready"
        );
        Ok(Self { pool, models })
    }

    #[must_use]
    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    fn checkout(&self) -> Result<PooledConnection<SqliteConnectionManager>, EngineError> {
        self.pool
            .get()
            .map_err(|err| EngineError::connection_failed(format!("connection checkout failed: {err}")))
    }
}

struct ModelWriter<'a, 'c> {
    models: &'a ModelRegistry,
    inner: SqlWriter<'c>,
}

impl TableWriter for ModelWriter<'_, '_> {
    fn read(&mut self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        let model = self.models.require(table)?;
        self.inner.read(model.table)
    }

    fn write_batch(&mut self, upsert: &Upsert<'_>) -> Result<usize, EngineError> {
        let model = self.models.require(upsert.table)?;
        // Columns come from the registered model, not from the caller's table description.
        self.inner.write_batch(&Upsert { table: model.table, ..*upsert })
    }

    fn delete_where(
        &mut self,
        table: &TableSpec,
        filter: &DeleteFilter,
    ) -> Result<usize, EngineError> {
        let model = self.models.require(table)?;
        if let DeleteFilter::NotEqual { column, .. } = filter {
            if !model.columns().contains(column) {
                return Err(EngineError::other(format!(
                    "model {} has no field {column}",
                    table.name
                )));
            }
        }
        self.inner.delete_where(table, filter)
    }
}

impl StorageEngine for OrmEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Orm
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn read(&self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        let model = self.models.require(table)?;
        let conn = self.checkout()?;
        sql::read_rows(&conn, model.table, ColumnPolicy::Declared)
    }

    fn unit_of_work(&self, work: &mut UnitOfWork<'_>) -> Result<(), EngineError> {
        let mut conn = self.checkout()?;
        let tx = conn.transaction().map_err(|err| sql::classify(&err))?;
        {
            let mut writer = ModelWriter {
                models: &self.models,
                inner: SqlWriter::new(&tx, ColumnPolicy::Declared),
            };
            work(&mut writer)?;
        }
        tx.commit().map_err(|err| sql::classify(&err))
    }
}
