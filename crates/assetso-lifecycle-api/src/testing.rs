//! In-memory engine used by unit tests across this crate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use assetso_lifecycle_core::{
    DeleteFilter, EngineError, EngineKind, Row, StorageEngine, TableSpec, TableWriter, UnitOfWork,
    Upsert,
};
use serde_json::Value;

use crate::selector::EngineConnector;

#[derive(Debug, Default, Clone)]
struct FakeState {
    tables: BTreeMap<String, Vec<Row>>,
    fail_writes_on: Option<String>,
    fail_reads: bool,
    fail_commit: bool,
    write_log: Vec<String>,
    delete_log: Vec<String>,
}

/// Shared-state engine: clones see the same tables.
#[derive(Debug, Clone)]
pub(crate) struct FakeEngine {
    kind: EngineKind,
    transactional: bool,
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub(crate) fn new(kind: EngineKind, transactional: bool) -> Self {
        Self { kind, transactional, state: Arc::new(Mutex::new(FakeState::default())) }
    }

    /// Engine with every catalog table present and empty.
    pub(crate) fn with_catalog(kind: EngineKind, transactional: bool) -> Self {
        let engine = Self::new(kind, transactional);
        for spec in assetso_lifecycle_core::catalog() {
            engine.create_table(spec.name);
        }
        engine
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn create_table(&self, name: &str) {
        self.lock().tables.entry(name.to_string()).or_default();
    }

    pub(crate) fn drop_table(&self, name: &str) {
        self.lock().tables.remove(name);
    }

    pub(crate) fn insert(&self, name: &str, rows: Vec<Row>) {
        self.lock().tables.entry(name.to_string()).or_default().extend(rows);
    }

    pub(crate) fn rows(&self, name: &str) -> Vec<Row> {
        self.lock().tables.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn fail_writes_on(&self, name: &str) {
        self.lock().fail_writes_on = Some(name.to_string());
    }

    pub(crate) fn fail_reads(&self) {
        self.lock().fail_reads = true;
    }

    /// Every unit of work runs, then fails to commit.
    pub(crate) fn fail_commit(&self) {
        self.lock().fail_commit = true;
    }

    pub(crate) fn write_log(&self) -> Vec<String> {
        self.lock().write_log.clone()
    }

    pub(crate) fn delete_log(&self) -> Vec<String> {
        self.lock().delete_log.clone()
    }

    pub(crate) fn connector(&self) -> Box<dyn EngineConnector> {
        Box::new(FakeConnector(self.clone()))
    }
}

struct FakeConnector(FakeEngine);

impl EngineConnector for FakeConnector {
    fn kind(&self) -> EngineKind {
        self.0.kind
    }

    fn connect(&self) -> Result<Box<dyn StorageEngine>, EngineError> {
        Ok(Box::new(self.0.clone()))
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

impl TableWriter for FakeState {
    fn read(&mut self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        self.tables
            .get(table.name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("no such table: {}", table.name)))
    }

    fn write_batch(&mut self, upsert: &Upsert<'_>) -> Result<usize, EngineError> {
        let name = upsert.table.name;
        self.write_log.push(name.to_string());
        if self.fail_writes_on.as_deref() == Some(name) {
            return Err(EngineError::constraint_violation(format!("injected failure on {name}")));
        }
        let Some(rows) = self.tables.get_mut(name) else {
            return Err(EngineError::not_found(format!("no such table: {name}")));
        };

        for incoming in upsert.rows {
            let key = upsert.conflict_key.iter().map(|c| text(incoming.get(*c))).collect::<Vec<_>>();
            if key.iter().any(Option::is_none) {
                return Err(EngineError::constraint_violation(format!("{name} row lacks its key")));
            }
            let existing = rows.iter_mut().find(|row| {
                upsert.conflict_key.iter().map(|c| text(row.get(*c))).collect::<Vec<_>>() == key
            });
            match existing {
                Some(row) => {
                    for (column, value) in incoming {
                        if upsert.is_update_column(column) {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                }
                None => rows.push(incoming.clone()),
            }
        }
        Ok(upsert.rows.len())
    }

    fn delete_where(
        &mut self,
        table: &TableSpec,
        filter: &DeleteFilter,
    ) -> Result<usize, EngineError> {
        self.delete_log.push(table.name.to_string());
        if self.fail_writes_on.as_deref() == Some(table.name) {
            return Err(EngineError::other(format!("injected failure on {}", table.name)));
        }
        let Some(rows) = self.tables.get_mut(table.name) else {
            return Err(EngineError::not_found(format!("no such table: {}", table.name)));
        };
        let before = rows.len();
        match filter {
            DeleteFilter::All => rows.clear(),
            DeleteFilter::NotEqual { column, value } => {
                rows.retain(|row| text(row.get(*column)).as_deref() == Some(value.as_str()));
            }
        }
        Ok(before - rows.len())
    }
}

impl StorageEngine for FakeEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn read(&self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(EngineError::connection_failed("injected read failure"));
        }
        state
            .tables
            .get(table.name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("no such table: {}", table.name)))
    }

    fn unit_of_work(&self, work: &mut UnitOfWork<'_>) -> Result<(), EngineError> {
        let mut state = self.lock();
        if self.transactional {
            let mut staged = state.clone();
            let result = work(&mut staged);
            // Logs survive a rollback so tests can inspect the attempted order.
            state.write_log.clone_from(&staged.write_log);
            state.delete_log.clone_from(&staged.delete_log);
            match result {
                Ok(()) if state.fail_commit => {
                    Err(EngineError::connection_failed("injected commit failure"))
                }
                Ok(()) => {
                    *state = staged;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            work(&mut *state)
        }
    }
}

pub(crate) fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture must be an object, got {other}"),
    }
}
