use assetso_lifecycle_core::{restore_order, DatabaseDump, StorageEngine, Table};

use crate::{CancellationFlag, LifecycleError};

/// Every catalog table read from one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dump: DatabaseDump,
    /// Tables the engine reported as absent; they appear in the dump as empty tables.
    pub missing_tables: Vec<String>,
}

/// Read the fixed table list in catalog order. The dump's table order never depends on the engine.
///
/// # Errors
/// Returns [`LifecycleError::Engine`] for any read failure other than a missing table, and
/// [`LifecycleError::Cancelled`] when `cancel` trips between tables.
pub fn read_snapshot(
    engine: &dyn StorageEngine,
    cancel: &CancellationFlag,
) -> Result<Snapshot, LifecycleError> {
    let mut dump = DatabaseDump::new();
    let mut missing_tables = Vec::new();

    for spec in restore_order() {
        cancel.check()?;
        let rows = match engine.read(spec) {
            Ok(rows) => rows,
            Err(err) if err.is_missing_table() => {
                tracing::warn!(engine = %engine.kind(), table = spec.name, error = %err, "table missing; exporting it empty");
                missing_tables.push(spec.name.to_string());
                Vec::new()
            }
            Err(err) => return Err(LifecycleError::engine(engine.kind(), err)),
        };
        tracing::debug!(engine = %engine.kind(), table = spec.name, rows = rows.len(), "table read");
        dump.push(Table::new(spec.name, rows));
    }

    Ok(Snapshot { dump, missing_tables })
}
