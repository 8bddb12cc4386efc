use std::borrow::Cow;
use std::collections::HashMap;

use assetso_lifecycle_core::{
    restore_order, table_spec, DatabaseDump, EngineError, RestoreMode, RestoreStatus,
    RestoreSummary, Row, StorageEngine, TableSpec, TableWriter, Upsert, USERS,
};
use serde_json::Value;

use crate::LifecycleError;

pub const RESTORE_BATCH_SIZE: usize = 500;

/// Upsert every catalog table of `dump` in dependency order as one unit of work.
///
/// Users are matched by email. When the target already holds that email under another id, the
/// target id wins and every user reference in later tables is rewritten to it.
///
/// On a transactional engine any failure rolls back the whole restore. On an engine without
/// transactions the tables written before the failure stay written and the error says so.
///
/// # Errors
/// Returns [`LifecycleError::RestoreFailed`] after a rollback, [`LifecycleError::PartialRestore`]
/// after a best-effort failure, or [`LifecycleError::Engine`] when the unit could not start.
pub fn restore_dump(
    engine: &dyn StorageEngine,
    dump: &DatabaseDump,
) -> Result<RestoreSummary, LifecycleError> {
    let mode = if engine.supports_transactions() {
        RestoreMode::Transactional
    } else {
        RestoreMode::BestEffort
    };
    let mut summary = RestoreSummary::new(engine.kind(), mode);
    summary.ignored_tables = dump
        .tables()
        .iter()
        .filter(|table| table_spec(&table.name).is_none())
        .map(|table| table.name.clone())
        .collect();
    for ignored in &summary.ignored_tables {
        tracing::warn!(engine = %engine.kind(), table = %ignored, "table not in catalog; ignored");
    }

    let mut failed_table: Option<&'static str> = None;
    let result = engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
        let mut user_ids = UserIdMap::default();
        for spec in restore_order() {
            let Some(table) = dump.get(spec.name) else {
                continue;
            };
            summary.tables.entry(spec.name.to_string()).or_insert(0);
            if spec.name == USERS {
                user_ids = match UserIdMap::against_target(writer, spec, &table.rows) {
                    Ok(map) => map,
                    Err(err) => {
                        failed_table = Some(spec.name);
                        return Err(err);
                    }
                };
                summary.remapped_users = user_ids.len();
            }

            for batch in table.rows.chunks(RESTORE_BATCH_SIZE) {
                let batch = user_ids.apply(spec, batch);
                match writer.write_batch(&Upsert::by_natural_key(spec, &batch)) {
                    Ok(rows) => summary.add_rows(spec.name, rows),
                    Err(err) if err.is_missing_table() => {
                        tracing::warn!(table = spec.name, error = %err, "target table missing; skipped");
                        summary.missing_tables.push(spec.name.to_string());
                        summary.tables.insert(spec.name.to_string(), 0);
                        break;
                    }
                    Err(err) => {
                        failed_table = Some(spec.name);
                        return Err(err);
                    }
                }
            }
            tracing::debug!(
                table = spec.name,
                rows = summary.tables.get(spec.name).copied().unwrap_or(0),
                "table restored"
            );
        }
        Ok(())
    });

    match result {
        Ok(()) => {
            tracing::info!(engine = %summary.engine, rows = summary.total_rows(), "restore complete");
            Ok(summary)
        }
        Err(reason) => Err(restore_failure(summary, failed_table, reason)),
    }
}

/// Archive user id to the id the target already uses for the same email.
#[derive(Debug, Default)]
struct UserIdMap(HashMap<String, Value>);

impl UserIdMap {
    fn against_target(
        writer: &mut dyn TableWriter,
        users: &TableSpec,
        archived: &[Row],
    ) -> Result<Self, EngineError> {
        let existing = match writer.read(users) {
            Ok(rows) => rows,
            // The write reports the missing table.
            Err(err) if err.is_missing_table() => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        let by_email = existing
            .iter()
            .filter_map(|row| Some((row.get("email")?.as_str()?, row.get("id")?)))
            .collect::<HashMap<_, _>>();

        let mut map = HashMap::new();
        for row in archived {
            let (Some(email), Some(id)) = (row.get("email").and_then(Value::as_str), row.get("id"))
            else {
                continue;
            };
            match by_email.get(email) {
                Some(&target) if target != id => {
                    tracing::debug!(email, archived = %id, target = %target, "user id remapped");
                    map.insert(id_text(id), target.clone());
                }
                _ => {}
            }
        }
        Ok(Self(map))
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn apply<'r>(&self, table: &TableSpec, rows: &'r [Row]) -> Cow<'r, [Row]> {
        if self.0.is_empty() || table.user_columns.is_empty() {
            return Cow::Borrowed(rows);
        }
        let mut rows = rows.to_vec();
        for row in &mut rows {
            for column in table.user_columns {
                let Some(value) = row.get_mut(*column) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                if let Some(target) = self.0.get(&id_text(value)) {
                    value.clone_from(target);
                }
            }
        }
        Cow::Owned(rows)
    }
}

fn id_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn restore_failure(
    mut summary: RestoreSummary,
    failed_table: Option<&'static str>,
    reason: EngineError,
) -> LifecycleError {
    let Some(table) = failed_table else {
        // Begin or commit failed; no table is to blame.
        return LifecycleError::engine(summary.engine, reason);
    };
    let table = table.to_string();
    match summary.mode {
        RestoreMode::Transactional => {
            summary.status = RestoreStatus::RolledBack;
            tracing::error!(engine = %summary.engine, table = %table, error = %reason, "restore rolled back");
            LifecycleError::RestoreFailed { table, reason, summary: Box::new(summary) }
        }
        RestoreMode::BestEffort => {
            summary.status = RestoreStatus::Partial;
            tracing::error!(engine = %summary.engine, table = %table, error = %reason, "best-effort restore stopped; store may be inconsistent");
            LifecycleError::PartialRestore { table, reason, summary: Box::new(summary) }
        }
    }
}
