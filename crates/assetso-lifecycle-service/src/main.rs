use std::io::{Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::{Context, Result};
use assetso_lifecycle_api::{
    preview_archive, CancelOnDrop, CancellationFlag, ConfigArgs, DataLifecycle, LifecycleError,
    MemberStream, API_CONTRACT_VERSION,
};
use assetso_lifecycle_core::{CleanSummary, EngineKind, Metadata, RestoreSummary, ADMIN_ROLE};
use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const USER_HEADER: &str = "x-assetso-user";
const ROLE_HEADER: &str = "x-assetso-role";
const ENGINE_HEADER: &str = "x-assetso-engine";
const ARCHIVE_FIELD: &str = "archive";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const CLIENT_CLOSED_REQUEST: u16 = 499;
const EXPORT_CHANNEL_DEPTH: usize = 4;

#[derive(Clone)]
struct ServiceState {
    lifecycle: Arc<DataLifecycle>,
    max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<serde_json::Value>,
}

#[derive(Debug)]
struct ServiceError {
    status: StatusCode,
    body: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    engines: Vec<EngineKind>,
}

#[derive(Debug, Parser)]
#[command(name = "assetso-lifecycle-service")]
#[command(about = "HTTP service for Assetso export, import and clean")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                service_contract_version: SERVICE_CONTRACT_VERSION,
                code,
                error: message.into(),
                summary: None,
            },
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    fn multipart(err: &MultipartError) -> Self {
        let status = err.status();
        let code =
            if status == StatusCode::PAYLOAD_TOO_LARGE { "PAYLOAD_TOO_LARGE" } else { "BAD_REQUEST" };
        Self::new(status, code, err.body_text())
    }
}

impl From<LifecycleError> for ServiceError {
    fn from(err: LifecycleError) -> Self {
        let (status, code) = match &err {
            LifecycleError::Configuration(_) => (StatusCode::SERVICE_UNAVAILABLE, "CONFIGURATION_ERROR"),
            LifecycleError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            LifecycleError::ChecksumMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "CHECKSUM_MISMATCH")
            }
            LifecycleError::PartialRestore { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PARTIAL_RESTORE")
            }
            LifecycleError::RestoreFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "RESTORE_FAILED"),
            LifecycleError::CleanFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CLEAN_FAILED"),
            LifecycleError::AllEnginesFailed { .. } => (StatusCode::BAD_GATEWAY, "ALL_ENGINES_FAILED"),
            LifecycleError::Engine { .. } => (StatusCode::BAD_GATEWAY, "ENGINE_ERROR"),
            LifecycleError::Cancelled => (
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
                "CANCELLED",
            ),
            LifecycleError::FileIo { .. }
            | LifecycleError::Archive(_)
            | LifecycleError::Migration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let summary = match (err.restore_summary(), err.clean_summary()) {
            (Some(summary), _) => serde_json::to_value(summary).ok(),
            (None, Some(summary)) => serde_json::to_value(summary).ok(),
            (None, None) => None,
        };
        let mut error = Self::new(status, code, err.to_string());
        error.body.summary = summary;
        error
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let code = self.body.code;
        if self.status.as_u16() == CLIENT_CLOSED_REQUEST {
            tracing::info!(code, "request abandoned by client");
        } else if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), code, error = %self.body.error, "request failed");
        } else {
            tracing::warn!(status = self.status.as_u16(), code, error = %self.body.error, "request rejected");
        }
        (self.status, Json(self.body)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Identity forwarded by the authentication collaborator, accepted only with the admin role.
fn require_admin(headers: &HeaderMap) -> Result<String, ServiceError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    match (header(USER_HEADER), header(ROLE_HEADER)) {
        (None, _) => Err(ServiceError::forbidden("missing authenticated identity")),
        (Some(user), Some(ADMIN_ROLE)) => Ok(user.to_string()),
        (Some(_), _) => Err(ServiceError::forbidden("administrator role required")),
    }
}

async fn run_blocking<T, F>(operation: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, LifecycleError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(operation).await {
        Ok(result) => Ok(result?),
        Err(err) => Err(ServiceError::internal(format!("lifecycle task failed: {err}"))),
    }
}

/// Spool the archive part of a multipart upload into an anonymous temp file.
async fn spool_archive(mut multipart: Multipart) -> Result<std::fs::File, ServiceError> {
    let spool_error = |err: std::io::Error| ServiceError::internal(format!("cannot spool upload: {err}"));

    while let Some(mut field) =
        multipart.next_field().await.map_err(|err| ServiceError::multipart(&err))?
    {
        if field.name() != Some(ARCHIVE_FIELD) && field.file_name().is_none() {
            continue;
        }
        let mut spool = tokio::fs::File::from_std(tempfile::tempfile().map_err(spool_error)?);
        let mut received = 0_usize;
        while let Some(chunk) = field.chunk().await.map_err(|err| ServiceError::multipart(&err))? {
            received += chunk.len();
            spool.write_all(&chunk).await.map_err(spool_error)?;
        }
        spool.flush().await.map_err(spool_error)?;
        tracing::debug!(bytes = received, "archive upload spooled");

        let mut spool = spool.into_std().await;
        spool.seek(SeekFrom::Start(0)).map_err(spool_error)?;
        return Ok(spool);
    }

    Err(LifecycleError::Validation(format!(
        "multipart body has no {ARCHIVE_FIELD:?} field or file part"
    ))
    .into())
}

fn app(state: ServiceState) -> Router {
    let max_upload_bytes = state.max_upload_bytes;
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/lifecycle/export", get(lifecycle_export))
        .route("/v1/lifecycle/import/preview", post(lifecycle_import_preview))
        .route("/v1/lifecycle/import", post(lifecycle_import))
        .route("/v1/lifecycle/clean", post(lifecycle_clean))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    match dotenv {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded environment file"),
        Err(err) if err.not_found() => {}
        Err(err) => tracing::warn!(error = %err, "ignoring unreadable environment file"),
    }

    let args = Args::parse();
    let config = args.config.resolve().context("invalid lifecycle configuration")?;
    let lifecycle = DataLifecycle::new(&config);
    tracing::info!(
        engines = ?lifecycle.engines(),
        uploads_dir = %config.uploads_dir.display(),
        "lifecycle configured"
    );

    let state = ServiceState { lifecycle: Arc::new(lifecycle), max_upload_bytes: args.max_upload_bytes };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok", engines: state.lifecycle.engines() }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn lifecycle_export(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let user = require_admin(&headers)?;
    let cancel = CancellationFlag::new();
    // Trips when the client goes away, before or during streaming.
    let guard = cancel.drop_guard();
    let lifecycle = Arc::clone(&state.lifecycle);
    let (report_sender, report) = oneshot::channel();
    let (chunk_sender, chunks) = mpsc::channel(EXPORT_CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let prepared = match lifecycle.prepare_export(&cancel) {
            Ok(prepared) => prepared,
            Err(err) => {
                let _ = report_sender.send(Err(err));
                return;
            }
        };
        if report_sender.send(Ok(prepared.report().clone())).is_err() {
            return;
        }
        let sink = MemberStream::new(ChunkSender(chunk_sender.clone()));
        let streamed = lifecycle.write_export(&prepared, sink, &cancel).and_then(|sink| {
            sink.finish().map_err(|err| LifecycleError::file_io("<export stream>", err))
        });
        let last = match streamed {
            Ok(_) => ExportChunk::Done,
            Err(err) => {
                tracing::error!(error = %err, "export stream aborted");
                ExportChunk::Failed(err.to_string())
            }
        };
        let _ = chunk_sender.blocking_send(last);
    });

    let report = match report.await {
        Ok(report) => report?,
        Err(_) => return Err(ServiceError::internal("lifecycle task failed before the export started")),
    };
    tracing::info!(
        user = %user,
        engine = %report.engine,
        file_name = %report.file_name,
        records = report.metadata.total_records,
        "streaming export"
    );
    let body = ExportBody { chunks, current: Vec::new(), offset: 0, guard: Some(guard) };
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/zip")
        .header(CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", report.file_name))
        .header(ENGINE_HEADER, report.engine.as_str())
        .body(Body::from_stream(ReaderStream::new(body)))
        .map_err(|err| ServiceError::internal(format!("cannot build export response: {err}")))
}

enum ExportChunk {
    Data(Vec<u8>),
    Done,
    Failed(String),
}

/// Blocking writer that hands each chunk to the response body.
struct ChunkSender(mpsc::Sender<ExportChunk>);

impl Write for ChunkSender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.0.blocking_send(ExportChunk::Data(buf.to_vec())).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "export client went away")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Response body fed by the export task. It ends cleanly only after the archive is complete,
/// and dropping it early cancels the export.
struct ExportBody {
    chunks: mpsc::Receiver<ExportChunk>,
    current: Vec<u8>,
    offset: usize,
    guard: Option<CancelOnDrop>,
}

impl AsyncRead for ExportBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let body = &mut *self;
        loop {
            if body.offset < body.current.len() {
                let end = body.current.len().min(body.offset + buf.remaining());
                buf.put_slice(&body.current[body.offset..end]);
                body.offset = end;
                return Poll::Ready(Ok(()));
            }
            match ready!(body.chunks.poll_recv(cx)) {
                Some(ExportChunk::Data(bytes)) => {
                    body.current = bytes;
                    body.offset = 0;
                }
                Some(ExportChunk::Done) => {
                    if let Some(guard) = body.guard.take() {
                        guard.disarm();
                    }
                    return Poll::Ready(Ok(()));
                }
                Some(ExportChunk::Failed(reason)) => {
                    return Poll::Ready(Err(std::io::Error::other(reason)));
                }
                None => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "export stopped before the archive was complete",
                    )));
                }
            }
        }
    }
}

async fn lifecycle_import_preview(
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<ServiceEnvelope<Metadata>>, ServiceError> {
    require_admin(&headers)?;
    let archive = spool_archive(multipart).await?;
    let metadata = run_blocking(move || preview_archive(archive)).await?;
    Ok(Json(envelope(metadata)))
}

async fn lifecycle_import(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<ServiceEnvelope<RestoreSummary>>, ServiceError> {
    let user = require_admin(&headers)?;
    let archive = spool_archive(multipart).await?;
    let lifecycle = Arc::clone(&state.lifecycle);
    let summary = run_blocking(move || lifecycle.import(archive)).await?;
    tracing::info!(user = %user, engine = %summary.engine, rows = summary.total_rows(), "import finished");
    Ok(Json(envelope(summary)))
}

async fn lifecycle_clean(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<CleanSummary>>, ServiceError> {
    let user = require_admin(&headers)?;
    let lifecycle = Arc::clone(&state.lifecycle);
    let summary = run_blocking(move || lifecycle.clean()).await?;
    tracing::info!(user = %user, engine = %summary.engine, rows = summary.total_rows(), "clean finished");
    Ok(Json(envelope(summary)))
}
