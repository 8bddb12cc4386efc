use assetso_lifecycle_core::{
    is_valid_identifier, DeleteFilter, EngineError, Row, TableSpec, TableWriter, Upsert,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::Value;

/// Which row columns reach the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnPolicy {
    /// Every column present in the row; names are validated, not checked against the catalog.
    AsProvided,
    /// Only the columns the table's model declares; anything else is dropped.
    Declared,
}

impl ColumnPolicy {
    fn accepts(self, table: &TableSpec, column: &str) -> bool {
        match self {
            Self::AsProvided => true,
            Self::Declared => table.has_column(column),
        }
    }
}

pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Map a native `rusqlite` error into the engine-neutral kinds.
pub(crate) fn classify(err: &rusqlite::Error) -> EngineError {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let text = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation => EngineError::constraint_violation(text),
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied => EngineError::connection_failed(text),
                _ if is_missing_relation(&text) => EngineError::not_found(text),
                _ => EngineError::other(text),
            }
        }
        other => {
            let text = other.to_string();
            if is_missing_relation(&text) {
                EngineError::not_found(text)
            } else {
                EngineError::other(text)
            }
        }
    }
}

fn is_missing_relation(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no such table")
        || lower.contains("does not exist")
        || lower.contains("undefined table")
}

pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                SqlValue::Integer(integer)
            } else if let Some(real) = number.as_f64() {
                SqlValue::Real(real)
            } else {
                SqlValue::Text(number.to_string())
            }
        }
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

pub(crate) fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

pub(crate) fn read_rows(
    conn: &Connection,
    table: &TableSpec,
    policy: ColumnPolicy,
) -> Result<Vec<Row>, EngineError> {
    let order_by = table.key.iter().map(|column| quote(column)).collect::<Vec<_>>().join(", ");
    let sql = format!("SELECT * FROM {} ORDER BY {order_by}", quote(table.name));
    let mut stmt = conn.prepare(&sql).map_err(|err| classify(&err))?;
    let names = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();

    let mut rows = stmt.query([]).map_err(|err| classify(&err))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|err| classify(&err))? {
        let mut values = Row::new();
        for (index, name) in names.iter().enumerate() {
            if !policy.accepts(table, name) {
                continue;
            }
            let value = row.get_ref(index).map_err(|err| classify(&err))?;
            values.insert(name.clone(), from_sql_value(value));
        }
        out.push(values);
    }
    Ok(out)
}

fn upsert_sql(upsert: &Upsert<'_>, columns: &[&str]) -> String {
    let column_list = columns.iter().map(|column| quote(column)).collect::<Vec<_>>().join(", ");
    let placeholders =
        (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
    let conflict = upsert.conflict_key.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let updates = columns
        .iter()
        .filter(|column| upsert.is_update_column(column))
        .map(|column| format!("{0} = excluded.{0}", quote(column)))
        .collect::<Vec<_>>();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON CONFLICT ({conflict}) {action}",
        quote(upsert.table.name)
    )
}

pub(crate) fn upsert_rows(
    conn: &Connection,
    upsert: &Upsert<'_>,
    policy: ColumnPolicy,
) -> Result<usize, EngineError> {
    let table = upsert.table.name;
    let mut written = 0_usize;

    for row in upsert.rows {
        let columns = row
            .keys()
            .map(String::as_str)
            .filter(|column| policy.accepts(upsert.table, column))
            .collect::<Vec<_>>();

        if let Some(invalid) = columns.iter().find(|column| !is_valid_identifier(column)) {
            return Err(EngineError::other(format!("invalid column name {invalid:?} for {table}")));
        }
        if let Some(missing) = upsert.conflict_key.iter().find(|key| !columns.contains(key)) {
            return Err(EngineError::constraint_violation(format!(
                "row for {table} is missing key column {missing}"
            )));
        }

        let sql = upsert_sql(upsert, &columns);
        let params = columns
            .iter()
            .map(|column| row.get(*column).map_or(SqlValue::Null, to_sql_value))
            .collect::<Vec<_>>();

        let mut stmt = conn.prepare_cached(&sql).map_err(|err| classify(&err))?;
        stmt.execute(params_from_iter(params.iter())).map_err(|err| classify(&err))?;
        written += 1;
    }

    Ok(written)
}

pub(crate) fn delete_rows(
    conn: &Connection,
    table: &TableSpec,
    filter: &DeleteFilter,
) -> Result<usize, EngineError> {
    match filter {
        DeleteFilter::All => conn
            .execute(&format!("DELETE FROM {}", quote(table.name)), [])
            .map_err(|err| classify(&err)),
        DeleteFilter::NotEqual { column, value } => {
            if !is_valid_identifier(column) {
                return Err(EngineError::other(format!("invalid filter column {column:?}")));
            }
            conn.execute(
                &format!("DELETE FROM {} WHERE {} IS NOT ?1", quote(table.name), quote(column)),
                [value],
            )
            .map_err(|err| classify(&err))
        }
    }
}

/// [`TableWriter`] over one connection or open transaction.
pub(crate) struct SqlWriter<'c> {
    conn: &'c Connection,
    policy: ColumnPolicy,
}

impl<'c> SqlWriter<'c> {
    pub(crate) fn new(conn: &'c Connection, policy: ColumnPolicy) -> Self {
        Self { conn, policy }
    }
}

impl TableWriter for SqlWriter<'_> {
    fn read(&mut self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        read_rows(self.conn, table, self.policy)
    }

    fn write_batch(&mut self, upsert: &Upsert<'_>) -> Result<usize, EngineError> {
        upsert_rows(self.conn, upsert, self.policy)
    }

    fn delete_where(
        &mut self,
        table: &TableSpec,
        filter: &DeleteFilter,
    ) -> Result<usize, EngineError> {
        delete_rows(self.conn, table, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetso_lifecycle_core::{table_spec, EngineErrorKind, USERS};
    use serde_json::json;

    #[test]
    fn missing_table_errors_classify_as_not_found() {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("in-memory sqlite must open: {err}"),
        };
        let Some(users) = table_spec(USERS) else {
            panic!("users must be in the catalog");
        };
        let err = match read_rows(&conn, users, ColumnPolicy::AsProvided) {
            Ok(rows) => panic!("expected missing table, got {} rows", rows.len()),
            Err(err) => err,
        };
        assert_eq!(err.kind, EngineErrorKind::NotFound);
    }

    #[test]
    fn json_values_map_onto_sqlite_storage_classes() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(42)), SqlValue::Integer(42));
        assert_eq!(to_sql_value(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(to_sql_value(&json!(null)), SqlValue::Null);
        assert_eq!(to_sql_value(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".to_string()));
        assert_eq!(from_sql_value(ValueRef::Blob(&[0xde, 0xad])), json!("dead"));
        assert_eq!(from_sql_value(ValueRef::Integer(7)), json!(7));
    }

    #[test]
    fn upsert_statement_skips_key_and_insert_only_columns() {
        let Some(users) = table_spec(USERS) else {
            panic!("users must be in the catalog");
        };
        let upsert =
            Upsert { table: users, conflict_key: &["email"], insert_only: &["id"], rows: &[] };
        let sql = upsert_sql(&upsert, &["id", "email", "role"]);
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"id\", \"email\", \"role\") VALUES (?1, ?2, ?3) \
             ON CONFLICT (\"email\") DO UPDATE SET \"role\" = excluded.\"role\""
        );

        let key_only = upsert_sql(&upsert, &["id", "email"]);
        assert!(key_only.ends_with("DO NOTHING"));
    }
}
