use std::io::{Read, Seek, Write};
use std::path::PathBuf;

use assetso_lifecycle_core::{
    sha256_hex, CleanSummary, DatabaseDigest, EngineKind, Metadata, RestoreSummary,
    ARCHIVE_FORMAT_VERSION,
};
use assetso_lifecycle_store_sqlite::SchemaStatus;
use serde::Serialize;
use time::OffsetDateTime;

mod archive;
mod assets;
mod binary_store;
mod cancel;
mod clean;
mod config;
mod error;
mod restore;
mod selector;
mod snapshot;
#[cfg(test)]
mod testing;

pub use archive::{archive_file_name, write_archive, ArchiveContents, LoadedArchive, MemberStream};
pub use assets::{collect_assets, CollectedAssets};
pub use binary_store::{
    normalize_reference, safe_relative_path, BinaryStore, FsBinaryStore, ImageReference,
    StoredFile,
};
pub use cancel::{CancelOnDrop, CancellationFlag};
pub use clean::{clean_store, hash_password};
pub use config::{
    parse_priority, AdminSeed, ConfigArgs, EngineConfig, LifecycleConfig,
    DEFAULT_ADMIN_PASSWORD, DEFAULT_ENGINE_PRIORITY,
};
pub use error::LifecycleError;
pub use restore::{restore_dump, RESTORE_BATCH_SIZE};
pub use selector::{EngineConnector, EngineSelector};
pub use snapshot::{read_snapshot, Snapshot};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportReport {
    pub engine: EngineKind,
    pub file_name: String,
    pub metadata: Metadata,
}

/// Snapshot bytes and file list of an export whose archive has not been written yet.
#[derive(Debug, Clone)]
pub struct PreparedExport {
    report: ExportReport,
    dump_bytes: Vec<u8>,
    files: Vec<String>,
}

impl PreparedExport {
    #[must_use]
    pub fn report(&self) -> &ExportReport {
        &self.report
    }
}

/// Validate an archive without touching any engine.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] or [`LifecycleError::ChecksumMismatch`].
pub fn preview_archive<R: Read + Seek>(reader: R) -> Result<Metadata, LifecycleError> {
    Ok(LoadedArchive::open(reader)?.metadata)
}

/// Export, import and clean against the configured engines and binary store.
pub struct DataLifecycle {
    selector: EngineSelector,
    store: Box<dyn BinaryStore>,
    admin: AdminSeed,
    app_version: String,
    database_path: Option<PathBuf>,
}

impl DataLifecycle {
    #[must_use]
    pub fn new(config: &LifecycleConfig) -> Self {
        let database_path = config
            .engines
            .local_path(EngineKind::Direct)
            .or_else(|| config.engines.local_path(EngineKind::Orm));
        Self {
            selector: EngineSelector::from_config(&config.engines),
            store: Box::new(FsBinaryStore::new(config.uploads_dir.clone())),
            admin: config.admin.clone(),
            app_version: config.app_version.clone(),
            database_path,
        }
    }

    #[must_use]
    pub fn from_parts(
        selector: EngineSelector,
        store: Box<dyn BinaryStore>,
        admin: AdminSeed,
        app_version: impl Into<String>,
    ) -> Self {
        Self { selector, store, admin, app_version: app_version.into(), database_path: None }
    }

    /// Configured engines in the order operations try them.
    #[must_use]
    pub fn engines(&self) -> Vec<EngineKind> {
        self.selector.ranked()
    }

    /// Create or upgrade the local schema that the direct and ORM engines read.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] without a local database URL, or
    /// [`LifecycleError::Migration`] when a step fails.
    pub fn migrate(&self) -> Result<SchemaStatus, LifecycleError> {
        let Some(path) = &self.database_path else {
            return Err(LifecycleError::Configuration(
                "DATABASE_URL does not name a local sqlite database".to_string(),
            ));
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| LifecycleError::file_io(parent.display().to_string(), err))?;
        }
        let status = assetso_lifecycle_store_sqlite::migrate_path(path)
            .map_err(|err| LifecycleError::Migration(format!("{err:#}")))?;
        tracing::info!(path = %path.display(), version = status.current_version, "schema migrated");
        Ok(status)
    }

    /// Snapshot the first engine that can be read, then stream the archive into `writer`.
    ///
    /// # Errors
    /// Returns [`LifecycleError::AllEnginesFailed`] when no engine can be read,
    /// [`LifecycleError::Cancelled`] when `cancel` trips, or the first archive failure.
    pub fn export<W: Write + Seek>(
        &self,
        writer: W,
        cancel: &CancellationFlag,
    ) -> Result<(W, ExportReport), LifecycleError> {
        let prepared = self.prepare_export(cancel)?;
        let writer = self.write_export(&prepared, writer, cancel)?;
        Ok((writer, prepared.report))
    }

    /// Read the snapshot and resolve its files; nothing is written yet.
    ///
    /// The engine connection is released before this returns.
    ///
    /// # Errors
    /// Returns [`LifecycleError::AllEnginesFailed`] when no engine can be read, or
    /// [`LifecycleError::Cancelled`] when `cancel` trips.
    pub fn prepare_export(&self, cancel: &CancellationFlag) -> Result<PreparedExport, LifecycleError> {
        let (engine, snapshot) = self
            .selector
            .attempt_in_order(|engine| Ok((engine.kind(), read_snapshot(engine, cancel)?)))?;
        cancel.check()?;

        let collected = collect_assets(&snapshot.dump, self.store.as_ref())?;
        let dump_bytes = snapshot
            .dump
            .to_bytes()
            .map_err(|err| LifecycleError::Archive(format!("cannot serialize dump: {err}")))?;

        let now = OffsetDateTime::now_utc();
        let file_name = archive_file_name(now);
        let exported_at = now
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| LifecycleError::Archive(format!("cannot format export time: {err}")))?;
        let metadata = Metadata {
            format_version: ARCHIVE_FORMAT_VERSION,
            name: file_name.trim_end_matches(".zip").to_string(),
            exported_at,
            app_version: self.app_version.clone(),
            engine: Some(engine),
            total_records: snapshot.dump.total_records(),
            table_counts: snapshot.dump.table_counts(),
            missing_tables: snapshot.missing_tables,
            database: DatabaseDigest {
                file_size_bytes: u64::try_from(dump_bytes.len()).unwrap_or(u64::MAX),
                checksum_sha256: sha256_hex(&dump_bytes),
            },
            images: collected.images,
        };

        Ok(PreparedExport {
            report: ExportReport { engine, file_name, metadata },
            dump_bytes,
            files: collected.files,
        })
    }

    /// Stream a prepared export into `writer`.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Cancelled`] when `cancel` trips, or the first zip or I/O failure.
    pub fn write_export<W: Write + Seek>(
        &self,
        prepared: &PreparedExport,
        writer: W,
        cancel: &CancellationFlag,
    ) -> Result<W, LifecycleError> {
        let report = &prepared.report;
        let contents = ArchiveContents {
            dump_bytes: &prepared.dump_bytes,
            metadata: &report.metadata,
            files: &prepared.files,
        };
        let writer = write_archive(writer, &contents, self.store.as_ref(), cancel)?;
        tracing::info!(
            engine = %report.engine,
            file_name = %report.file_name,
            records = report.metadata.total_records,
            files = prepared.files.len(),
            "export complete"
        );
        Ok(writer)
    }

    /// Validate the archive, restore it into the selected engine, then write its files.
    ///
    /// Nothing is written anywhere unless the archive validates. Files are extracted only once
    /// the relational restore has completed.
    ///
    /// # Errors
    /// Returns validation and checksum errors before any mutation, or the restore failure with
    /// its partial summary.
    pub fn import<R: Read + Seek>(&self, reader: R) -> Result<RestoreSummary, LifecycleError> {
        let mut archive = LoadedArchive::open(reader)?;
        let engine = self.selector.select()?;
        let mut summary = restore_dump(engine.as_ref(), &archive.dump)?;
        drop(engine);

        summary.files = archive.extract_files(self.store.as_ref());
        tracing::info!(
            engine = %summary.engine,
            rows = summary.total_rows(),
            files_written = summary.files.written,
            files_failed = summary.files.failed,
            "import complete"
        );
        Ok(summary)
    }

    /// Wipe operational data on the first engine that can complete it and reseed the admin.
    ///
    /// # Errors
    /// Returns [`LifecycleError::CleanFailed`] or [`LifecycleError::AllEnginesFailed`].
    pub fn clean(&self) -> Result<CleanSummary, LifecycleError> {
        self.selector.attempt_in_order(|engine| clean_store(engine, &self.admin))
    }
}
