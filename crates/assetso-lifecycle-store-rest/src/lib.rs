//! Engine adapter for a PostgREST-style relational HTTP service.
//!
//! Every table is a resource under the configured base URL (`{base}/{table}`). Requests carry the
//! service key both as `apikey` and as a bearer token. The service offers no multi-request
//! transactions, so each [`TableWriter`] call is applied as soon as it is made.

use std::time::Duration;

use assetso_lifecycle_core::{
    is_valid_identifier, DeleteFilter, EngineError, EngineKind, Row, StorageEngine, TableSpec,
    TableWriter, UnitOfWork, Upsert,
};
use serde_json::Value;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    pub base_url: String,
    pub service_key: String,
    pub page_size: usize,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

pub struct RestEngine {
    agent: ureq::Agent,
    base_url: String,
    service_key: String,
    page_size: usize,
}

impl RestEngine {
    /// Build the HTTP agent and probe the service root.
    ///
    /// # Errors
    /// Returns `ConnectionFailed` when the URL or key is empty, the service is unreachable, or it
    /// rejects the key.
    pub fn connect(config: &RestConfig) -> Result<Self, EngineError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() || config.service_key.trim().is_empty() {
            return Err(EngineError::connection_failed("rest url and service key are required"));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build();
        let engine = Self {
            agent,
            base_url,
            service_key: config.service_key.clone(),
            page_size: config.page_size.max(1),
        };
        engine.probe()?;

        tracing::debug!(engine = %EngineKind::Rest, base_url = %engine.base_url, "service reachable");
        Ok(engine)
    }

    fn probe(&self) -> Result<(), EngineError> {
        let url = format!("{}/", self.base_url);
        match self.authorized("GET", url).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status @ (401 | 403), response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(EngineError::connection_failed(format!(
                    "service rejected credentials ({status}): {body}"
                )))
            }
            // Any other HTTP answer proves the service is up.
            Err(ureq::Error::Status(_, _)) => Ok(()),
            Err(err @ ureq::Error::Transport(_)) => Err(classify_ureq(err)),
        }
    }

    fn authorized(&self, method: &str, url: String) -> ureq::Request {
        self.agent
            .request(method, &url)
            .set("apikey", &self.service_key)
            .set("Authorization", &format!("Bearer {}", self.service_key))
    }

    fn table_request(&self, method: &str, table: &TableSpec) -> ureq::Request {
        self.authorized(method, format!("{}/{}", self.base_url, table.name))
    }

    fn find_existing(&self, upsert: &Upsert<'_>, row: &Row) -> Result<bool, EngineError> {
        let select = upsert.conflict_key.join(",");
        let mut request = self.table_request("GET", upsert.table).query("select", &select);
        for key in upsert.conflict_key {
            request = request.query(key, &format!("eq.{}", filter_value(upsert.table, key, row)?));
        }
        let response = request.query("limit", "1").call().map_err(classify_ureq)?;
        let found: Vec<Row> = response
            .into_json()
            .map_err(|err| EngineError::other(format!("invalid lookup response: {err}")))?;
        Ok(!found.is_empty())
    }

    fn merge_batch(&self, upsert: &Upsert<'_>) -> Result<usize, EngineError> {
        let on_conflict = upsert.conflict_key.join(",");
        self.table_request("POST", upsert.table)
            .query("on_conflict", &on_conflict)
            .set("Prefer", "resolution=merge-duplicates,return=minimal")
            .send_json(upsert.rows)
            .map_err(classify_ureq)?;
        Ok(upsert.rows.len())
    }

    // Merge-duplicates would overwrite insert-only columns, so each row is looked up first.
    fn guarded_upsert(&self, upsert: &Upsert<'_>) -> Result<usize, EngineError> {
        for row in upsert.rows {
            if self.find_existing(upsert, row)? {
                let patch = row
                    .iter()
                    .filter(|(column, _)| upsert.is_update_column(column))
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect::<Row>();
                if patch.is_empty() {
                    continue;
                }
                let mut request =
                    self.table_request("PATCH", upsert.table).set("Prefer", "return=minimal");
                for key in upsert.conflict_key {
                    request =
                        request.query(key, &format!("eq.{}", filter_value(upsert.table, key, row)?));
                }
                request.send_json(&patch).map_err(classify_ureq)?;
            } else {
                self.table_request("POST", upsert.table)
                    .set("Prefer", "return=minimal")
                    .send_json([row])
                    .map_err(classify_ureq)?;
            }
        }
        Ok(upsert.rows.len())
    }
}

impl StorageEngine for RestEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Rest
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn read(&self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        let order = table.key.iter().map(|column| format!("{column}.asc")).collect::<Vec<_>>();
        let order = order.join(",");
        let limit = self.page_size.to_string();
        let mut rows = Vec::new();

        loop {
            let response = self
                .table_request("GET", table)
                .query("select", "*")
                .query("order", &order)
                .query("limit", &limit)
                .query("offset", &rows.len().to_string())
                .call()
                .map_err(classify_ureq)?;
            let page: Vec<Row> = response.into_json().map_err(|err| {
                EngineError::other(format!("invalid rows response for {}: {err}", table.name))
            })?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < self.page_size {
                break;
            }
        }

        Ok(rows)
    }

    fn unit_of_work(&self, work: &mut UnitOfWork<'_>) -> Result<(), EngineError> {
        let mut writer = RestWriter { engine: self };
        work(&mut writer)
    }
}

struct RestWriter<'a> {
    engine: &'a RestEngine,
}

impl TableWriter for RestWriter<'_> {
    fn read(&mut self, table: &TableSpec) -> Result<Vec<Row>, EngineError> {
        self.engine.read(table)
    }

    fn write_batch(&mut self, upsert: &Upsert<'_>) -> Result<usize, EngineError> {
        if upsert.rows.is_empty() {
            return Ok(0);
        }
        for row in upsert.rows {
            if let Some(invalid) = row.keys().find(|column| !is_valid_identifier(column)) {
                return Err(EngineError::other(format!(
                    "invalid column name {invalid:?} for {}",
                    upsert.table.name
                )));
            }
        }

        if upsert.insert_only.is_empty() {
            self.engine.merge_batch(upsert)
        } else {
            self.engine.guarded_upsert(upsert)
        }
    }

    fn delete_where(
        &mut self,
        table: &TableSpec,
        filter: &DeleteFilter,
    ) -> Result<usize, EngineError> {
        let request = self.engine.table_request("DELETE", table).set("Prefer", "count=exact");
        let request = match filter {
            DeleteFilter::All => {
                let key = table.key.first().copied().unwrap_or("id");
                request.query(key, "not.is.null")
            }
            DeleteFilter::NotEqual { column, value } => {
                if !is_valid_identifier(column) {
                    return Err(EngineError::other(format!("invalid filter column {column:?}")));
                }
                let quoted = quote_filter_value(value);
                request.query("or", &format!("({column}.neq.{quoted},{column}.is.null)"))
            }
        };

        let response = request.call().map_err(classify_ureq)?;
        Ok(response.header("content-range").and_then(parse_content_range_total).unwrap_or(0))
    }
}

fn filter_value(table: &TableSpec, column: &str, row: &Row) -> Result<String, EngineError> {
    match row.get(column) {
        None | Some(Value::Null) => Err(EngineError::constraint_violation(format!(
            "row for {} is missing key column {column}",
            table.name
        ))),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Ok(other.to_string()),
    }
}

fn quote_filter_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `Content-Range: 0-9/10` or `*/10` → 10.
fn parse_content_range_total(header: &str) -> Option<usize> {
    header.rsplit('/').next()?.trim().parse().ok()
}

fn classify_ureq(err: ureq::Error) -> EngineError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(status, &body)
        }
        ureq::Error::Transport(transport) => EngineError::connection_failed(transport.to_string()),
    }
}

/// Map an HTTP error answer onto the engine-neutral kinds.
#[must_use]
pub fn classify_status(status: u16, body: &str) -> EngineError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|value| value.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let code = field("code");
    let message = match field("message") {
        text if text.is_empty() => format!("http {status}: {body}"),
        text => format!("http {status} ({code}): {text}"),
    };
    let lower = message.to_ascii_lowercase();

    // A bare 404 is a wrong base path or proxy, not a missing table.
    if code == "PGRST205"
        || code == "42P01"
        || lower.contains("schema cache")
        || lower.contains("does not exist")
    {
        EngineError::not_found(message)
    } else if status == 404 {
        EngineError::connection_failed(message)
    } else if code.starts_with("23") || status == 409 {
        EngineError::constraint_violation(message)
    } else if matches!(status, 401 | 403 | 502 | 503 | 504) {
        EngineError::connection_failed(message)
    } else {
        EngineError::other(message)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use assetso_lifecycle_core::{
        table_spec, EngineErrorKind, ADMIN_EMAIL, ASSETS, CATEGORIES, LOGS, USERS,
    };
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    const SERVICE_KEY: &str = "service-key";

    type Tables = Arc<Mutex<BTreeMap<String, Vec<Row>>>>;

    #[derive(Clone)]
    struct MockState {
        tables: Tables,
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn spec(name: &str) -> &'static TableSpec {
        match table_spec(name) {
            Some(spec) => spec,
            None => panic!("{name} must be in the catalog"),
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("apikey").and_then(|value| value.to_str().ok()) == Some(SERVICE_KEY)
    }

    fn missing_table(table: &str) -> Response {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "code": "PGRST205",
                "message": format!("Could not find the table 'public.{table}' in the schema cache")
            })),
        )
            .into_response()
    }

    fn text(value: Option<&Value>) -> String {
        match value {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn matches_eq(row: &Row, params: &HashMap<String, String>) -> bool {
        params.iter().all(|(column, filter)| match filter.strip_prefix("eq.") {
            Some(expected) => text(row.get(column)) == expected,
            None => true,
        })
    }

    async fn root(headers: HeaderMap) -> Response {
        if authorized(&headers) {
            Json(json!({"swagger": "2.0"})).into_response()
        } else {
            StatusCode::UNAUTHORIZED.into_response()
        }
    }

    async fn list(
        State(state): State<MockState>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        let tables = state.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(rows) = tables.get(&table) else {
            return missing_table(&table);
        };
        let offset = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0_usize);
        let limit = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(usize::MAX);
        let mut page = rows.iter().filter(|row| matches_eq(row, &params)).cloned().collect::<Vec<_>>();
        if let Some(order) = params.get("order").and_then(|o| o.split('.').next()) {
            page.sort_by_key(|row| text(row.get(order)));
        }
        Json(page.into_iter().skip(offset).take(limit).collect::<Vec<_>>()).into_response()
    }

    async fn insert(
        State(state): State<MockState>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Json(incoming): Json<Vec<Row>>,
    ) -> Response {
        let mut tables = state.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if table == "assets" {
            let categories = tables.get(CATEGORIES).cloned().unwrap_or_default();
            for candidate in &incoming {
                let category = text(candidate.get("category_id"));
                if !categories.iter().any(|c| text(c.get("id")) == category) {
                    return (
                        StatusCode::CONFLICT,
                        Json(json!({"code": "23503", "message": "violates foreign key constraint"})),
                    )
                        .into_response();
                }
            }
        }
        let Some(rows) = tables.get_mut(&table) else {
            return missing_table(&table);
        };
        let merge = headers
            .get("prefer")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("merge-duplicates"));
        let key = params.get("on_conflict").cloned().unwrap_or_else(|| "id".to_string());

        for candidate in incoming {
            let existing = rows.iter_mut().find(|r| text(r.get(&key)) == text(candidate.get(&key)));
            match existing {
                Some(current) if merge => current.extend(candidate),
                Some(_) => {
                    return (
                        StatusCode::CONFLICT,
                        Json(json!({"code": "23505", "message": "duplicate key value"})),
                    )
                        .into_response();
                }
                None => rows.push(candidate),
            }
        }
        StatusCode::CREATED.into_response()
    }

    async fn update(
        State(state): State<MockState>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        Json(patch): Json<Row>,
    ) -> Response {
        let mut tables = state.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(rows) = tables.get_mut(&table) else {
            return missing_table(&table);
        };
        for current in rows.iter_mut().filter(|r| matches_eq(r, &params)) {
            current.extend(patch.clone());
        }
        StatusCode::NO_CONTENT.into_response()
    }

    async fn remove(
        State(state): State<MockState>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        let mut tables = state.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(rows) = tables.get_mut(&table) else {
            return missing_table(&table);
        };
        let before = rows.len();
        if let Some(or) = params.get("or") {
            // (column.neq."value",column.is.null)
            let inner = or.trim_start_matches('(');
            let (column, rest) = inner.split_once(".neq.").unwrap_or(("", ""));
            let value = rest.split(',').next().unwrap_or_default().trim_matches('"').to_string();
            rows.retain(|r| matches!(r.get(column), Some(Value::String(v)) if *v == value));
        } else {
            rows.clear();
        }
        let deleted = before - rows.len();
        (StatusCode::NO_CONTENT, [("content-range", format!("*/{deleted}"))]).into_response()
    }

    fn spawn_mock(tables: Tables) -> Result<SocketAddr> {
        let (sender, receiver) = std::sync::mpsc::channel();
        let router = Router::new()
            .route("/rest/v1/", get(root))
            .route("/rest/v1/:table", get(list).post(insert).patch(update).delete(remove))
            .with_state(MockState { tables });

        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => panic!("mock runtime must start: {err}"),
            };
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
                    Ok(listener) => listener,
                    Err(err) => panic!("mock listener must bind: {err}"),
                };
                let _ = sender.send(listener.local_addr());
                let _ = axum::serve(listener, router).await;
            });
        });

        Ok(receiver.recv()??)
    }

    fn seeded(tables: &[&str]) -> Tables {
        let map = tables.iter().map(|name| ((*name).to_string(), Vec::new())).collect();
        Arc::new(Mutex::new(map))
    }

    fn connect(addr: SocketAddr, page_size: usize) -> Result<RestEngine> {
        let mut config = RestConfig::new(format!("http://{addr}/rest/v1/"), SERVICE_KEY);
        config.page_size = page_size;
        Ok(RestEngine::connect(&config)?)
    }

    #[test]
    fn classifies_postgrest_error_bodies() {
        let missing = classify_status(404, r#"{"code":"PGRST205","message":"schema cache"}"#);
        assert_eq!(missing.kind, EngineErrorKind::NotFound);
        let undefined = classify_status(400, r#"{"code":"42P01","message":"relation x"}"#);
        assert_eq!(undefined.kind, EngineErrorKind::NotFound);
        let fk = classify_status(409, r#"{"code":"23503","message":"fk"}"#);
        assert_eq!(fk.kind, EngineErrorKind::ConstraintViolation);
        let unavailable = classify_status(503, "upstream down");
        assert_eq!(unavailable.kind, EngineErrorKind::ConnectionFailed);
        assert_eq!(classify_status(500, "boom").kind, EngineErrorKind::Other);
    }

    #[test]
    fn bare_not_found_is_a_connection_failure() {
        let html = classify_status(404, "<html><body>Not Found</body></html>");
        assert_eq!(html.kind, EngineErrorKind::ConnectionFailed);
        assert!(!html.is_missing_table());
        let empty = classify_status(404, "");
        assert_eq!(empty.kind, EngineErrorKind::ConnectionFailed);
    }

    #[test]
    fn wrong_base_path_does_not_read_as_missing_tables() -> Result<()> {
        let addr = spawn_mock(seeded(&[USERS]))?;
        let config = RestConfig::new(format!("http://{addr}/elsewhere"), SERVICE_KEY);
        let engine = RestEngine::connect(&config)?;
        let err = match engine.read(spec(USERS)) {
            Ok(rows) => panic!("expected a failure, got {} rows", rows.len()),
            Err(err) => err,
        };
        assert_eq!(err.kind, EngineErrorKind::ConnectionFailed);
        Ok(())
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("*/12"), Some(12));
        assert_eq!(parse_content_range_total("0-9/10"), Some(10));
        assert_eq!(parse_content_range_total("*/*"), None);
    }

    #[test]
    fn wrong_key_or_unreachable_service_fails_to_connect() -> Result<()> {
        let addr = spawn_mock(seeded(&[USERS]))?;
        let bad_key = RestConfig::new(format!("http://{addr}/rest/v1"), "wrong");
        let err = match RestEngine::connect(&bad_key) {
            Ok(_) => panic!("wrong key must be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.kind, EngineErrorKind::ConnectionFailed);

        let empty = RestConfig::new("", SERVICE_KEY);
        assert!(RestEngine::connect(&empty).is_err());
        Ok(())
    }

    #[test]
    fn reads_page_through_every_row() -> Result<()> {
        let tables = seeded(&[LOGS]);
        {
            let mut guard = tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let rows = (1..=5).map(|id| row(json!({"id": id, "action": "scan"}))).collect();
            guard.insert(LOGS.to_string(), rows);
        }
        let engine = connect(spawn_mock(tables)?, 2)?;
        let rows = engine.read(spec(LOGS))?;
        assert_eq!(rows.len(), 5);
        Ok(())
    }

    #[test]
    fn missing_remote_table_reads_as_not_found() -> Result<()> {
        let engine = connect(spawn_mock(seeded(&[USERS]))?, DEFAULT_PAGE_SIZE)?;
        let err = match engine.read(spec(CATEGORIES)) {
            Ok(rows) => panic!("expected missing table, got {} rows", rows.len()),
            Err(err) => err,
        };
        assert!(err.is_missing_table());
        Ok(())
    }

    #[test]
    fn insert_only_columns_survive_an_existing_row() -> Result<()> {
        let tables = seeded(&[USERS]);
        {
            let mut guard = tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.insert(
                USERS.to_string(),
                vec![row(json!({"id": "original", "email": ADMIN_EMAIL, "password": "old"}))],
            );
        }
        let engine = connect(spawn_mock(tables)?, DEFAULT_PAGE_SIZE)?;
        let admin = vec![row(json!({"id": "fresh", "email": ADMIN_EMAIL, "password": "new"}))];
        let upsert =
            Upsert { table: spec(USERS), conflict_key: &["email"], insert_only: &["id"], rows: &admin };

        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| writer.write_batch(&upsert).map(|_| ()))?;

        let users = engine.read(spec(USERS))?;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].get("id"), Some(&json!("original")));
        assert_eq!(users[0].get("password"), Some(&json!("new")));
        Ok(())
    }

    #[test]
    fn natural_key_user_upsert_keeps_the_remote_id() -> Result<()> {
        let tables = seeded(&[USERS]);
        {
            let mut guard = tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.insert(
                USERS.to_string(),
                vec![row(json!({
                    "id": "reseeded", "email": ADMIN_EMAIL, "password": "old", "created_at": "t0"
                }))],
            );
        }
        let engine = connect(spawn_mock(tables)?, DEFAULT_PAGE_SIZE)?;
        let archived = vec![row(json!({
            "id": "archived", "email": ADMIN_EMAIL, "password": "new", "created_at": "t1"
        }))];

        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(USERS), &archived)).map(|_| ())
        })?;

        let users = engine.read(spec(USERS))?;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].get("id"), Some(&json!("reseeded")));
        assert_eq!(users[0].get("created_at"), Some(&json!("t0")));
        assert_eq!(users[0].get("password"), Some(&json!("new")));
        Ok(())
    }

    #[test]
    fn constraint_failures_are_classified_and_earlier_writes_stay() -> Result<()> {
        let engine = connect(spawn_mock(seeded(&[CATEGORIES, ASSETS]))?, DEFAULT_PAGE_SIZE)?;
        let categories = vec![row(json!({"id": "c1", "name": "Laptops"}))];
        let assets = vec![row(json!({"id": "a1", "category_id": "ghost"}))];

        let result = engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            writer.write_batch(&Upsert::by_natural_key(spec(CATEGORIES), &categories))?;
            writer.write_batch(&Upsert::by_natural_key(spec(ASSETS), &assets))?;
            Ok(())
        });

        let err = match result {
            Ok(()) => panic!("dangling category must be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.kind, EngineErrorKind::ConstraintViolation);
        assert_eq!(engine.read(spec(CATEGORIES))?.len(), 1);
        Ok(())
    }

    #[test]
    fn role_filtered_delete_reports_deleted_count() -> Result<()> {
        let tables = seeded(&[USERS]);
        {
            let mut guard = tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.insert(
                USERS.to_string(),
                vec![
                    row(json!({"id": "u1", "email": ADMIN_EMAIL, "role": "ADMIN"})),
                    row(json!({"id": "u2", "email": "a@assetso.com", "role": "STAFF"})),
                    row(json!({"id": "u3", "email": "b@assetso.com", "role": null})),
                ],
            );
        }
        let engine = connect(spawn_mock(tables)?, DEFAULT_PAGE_SIZE)?;
        let mut deleted = 0;
        engine.unit_of_work(&mut |writer: &mut dyn TableWriter| {
            deleted = writer.delete_where(
                spec(USERS),
                &DeleteFilter::NotEqual { column: "role", value: "ADMIN".to_string() },
            )?;
            Ok(())
        })?;
        assert_eq!(deleted, 2);
        assert_eq!(engine.read(spec(USERS))?.len(), 1);
        Ok(())
    }
}
