use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use assetso_lifecycle_core::{
    deletion_order, table_spec, CleanStatus, CleanSummary, DeleteFilter, EngineError, Row,
    StorageEngine, TableWriter, Upsert, ADMIN_ROLE, USERS,
};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::config::AdminSeed;
use crate::LifecycleError;

/// Argon2id PHC string for `password` with a fresh random salt.
///
/// # Errors
/// Returns [`LifecycleError::Configuration`] when the hasher rejects its input.
pub fn hash_password(password: &str) -> Result<String, LifecycleError> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|err| LifecycleError::Configuration(format!("cannot encode password salt: {err}")))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| LifecycleError::Configuration(format!("cannot hash admin password: {err}")))?;
    Ok(hash.to_string())
}

fn admin_row(seed: &AdminSeed, password_hash: String) -> Result<Row, LifecycleError> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LifecycleError::Configuration(format!("cannot format timestamp: {err}")))?;
    let mut row = Row::new();
    row.insert("id".to_string(), Value::String(Ulid::new().to_string()));
    row.insert("email".to_string(), Value::String(seed.email.clone()));
    row.insert("name".to_string(), Value::String(seed.name.clone()));
    row.insert("password".to_string(), Value::String(password_hash));
    row.insert("role".to_string(), Value::String(ADMIN_ROLE.to_string()));
    row.insert("is_active".to_string(), Value::from(1));
    row.insert("created_at".to_string(), Value::String(now.clone()));
    row.insert("updated_at".to_string(), Value::String(now));
    Ok(row)
}

/// Empty every operational table in reverse dependency order, then reseed the admin account.
///
/// Absent tables count as zero. Any other failure stops the clean: transactional engines roll
/// back, others stop where they are.
///
/// # Errors
/// Returns [`LifecycleError::CleanFailed`] with the counts so far, or
/// [`LifecycleError::Configuration`] when the admin password cannot be hashed.
pub fn clean_store(
    engine: &dyn StorageEngine,
    seed: &AdminSeed,
) -> Result<CleanSummary, LifecycleError> {
    let admin = vec![admin_row(seed, hash_password(&seed.password)?)?];
    let Some(users) = table_spec(USERS) else {
        return Err(LifecycleError::Configuration("catalog has no users table".to_string()));
    };

    let mut summary = CleanSummary::new(engine.kind());
    let mut failed_table: Option<&'static str> = None;
    let result = engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
        for spec in deletion_order() {
            let filter = if spec.name == USERS {
                DeleteFilter::NotEqual { column: "role", value: ADMIN_ROLE.to_string() }
            } else {
                DeleteFilter::All
            };
            match writer.delete_where(spec, &filter) {
                Ok(rows) => {
                    tracing::debug!(table = spec.name, rows, "table cleaned");
                    summary.tables.insert(spec.name.to_string(), rows);
                }
                Err(err) if err.is_missing_table() => {
                    tracing::warn!(table = spec.name, error = %err, "table missing; nothing to clean");
                    summary.tables.insert(spec.name.to_string(), 0);
                    summary.missing_tables.push(spec.name.to_string());
                }
                Err(err) => {
                    failed_table = Some(spec.name);
                    return Err(err);
                }
            }
        }

        // Matched by email; an existing admin keeps its id and creation time.
        match writer.write_batch(&Upsert::by_natural_key(users, &admin)) {
            Ok(_) => summary.admin_reseeded = true,
            Err(err) if err.is_missing_table() => {
                tracing::warn!(error = %err, "users table missing; admin not reseeded");
            }
            Err(err) => {
                failed_table = Some(USERS);
                return Err(err);
            }
        }
        Ok(())
    });

    match result {
        Ok(()) => {
            tracing::info!(engine = %summary.engine, rows = summary.total_rows(), admin_reseeded = summary.admin_reseeded, "clean complete");
            Ok(summary)
        }
        Err(reason) => Err(clean_failure(engine, summary, failed_table, reason)),
    }
}

fn clean_failure(
    engine: &dyn StorageEngine,
    mut summary: CleanSummary,
    failed_table: Option<&'static str>,
    reason: EngineError,
) -> LifecycleError {
    let Some(table) = failed_table else {
        // Begin or commit failed; no table is to blame.
        tracing::error!(engine = %summary.engine, error = %reason, "clean could not complete its unit of work");
        return LifecycleError::engine(summary.engine, reason);
    };
    summary.admin_reseeded = false;
    summary.status = if engine.supports_transactions() {
        CleanStatus::RolledBack
    } else {
        CleanStatus::Aborted
    };
    tracing::error!(engine = %summary.engine, table, error = %reason, status = ?summary.status, "clean failed");
    LifecycleError::CleanFailed { table: table.to_string(), reason, summary: Box::new(summary) }
}
