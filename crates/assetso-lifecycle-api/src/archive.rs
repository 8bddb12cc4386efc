use std::collections::BTreeSet;
use std::io::{self, Read, Seek, SeekFrom, Write};

use assetso_lifecycle_core::{
    verify_sha256, DatabaseDump, FileFailure, FileRestoreSummary, Metadata, DATABASE_ENTRY,
    METADATA_ENTRY, UPLOADS_PREFIX,
};
use time::macros::format_description;
use time::OffsetDateTime;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::binary_store::{safe_relative_path, BinaryStore};
use crate::{CancellationFlag, LifecycleError};

const COPY_CHUNK: usize = 64 * 1024;

/// `assetso-backup-2026-01-31T09-15-00Z.zip`
#[must_use]
pub fn archive_file_name(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]Z");
    let stamp = at
        .to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("assetso-backup-{stamp}.zip")
}

pub struct ArchiveContents<'a> {
    /// Exact bytes the metadata checksum was computed over.
    pub dump_bytes: &'a [u8],
    pub metadata: &'a Metadata,
    /// Distinct store paths, written under `uploads/` in this order.
    pub files: &'a [String],
}

/// Seekable sink over a forward-only writer such as a response body.
///
/// Bytes are held until the next `flush`, which the archive writer issues after each member;
/// until then it may still seek back and patch that member's header. Seeking behind bytes that
/// were already sent fails.
pub struct MemberStream<W: Write> {
    inner: W,
    sent: u64,
    pending: Vec<u8>,
    cursor: u64,
}

impl<W: Write> MemberStream<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, sent: 0, pending: Vec::new(), cursor: 0 }
    }

    /// Bytes handed to the inner writer so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Send whatever is still held and return the inner writer.
    ///
    /// # Errors
    /// Returns the inner writer's error.
    pub fn finish(mut self) -> io::Result<W> {
        self.send()?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn end(&self) -> u64 {
        self.sent + self.pending.len() as u64
    }

    fn send(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&self.pending)?;
        self.sent += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

fn already_sent() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "cannot rewrite archive bytes already sent")
}

impl<W: Write> Write for MemberStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let offset = self.cursor.checked_sub(self.sent).ok_or_else(already_sent)?;
        let offset = usize::try_from(offset).map_err(|_| already_sent())?;
        if self.pending.len() < offset {
            self.pending.resize(offset, 0);
        }
        let overlap = (self.pending.len() - offset).min(buf.len());
        self.pending[offset..offset + overlap].copy_from_slice(&buf[..overlap]);
        self.pending.extend_from_slice(&buf[overlap..]);
        self.cursor += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()?;
        self.inner.flush()
    }
}

impl<W: Write> Seek for MemberStream<W> {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.end().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.cursor.checked_add_signed(delta),
        };
        match target {
            Some(target) if target >= self.sent => {
                self.cursor = target;
                Ok(target)
            }
            _ => Err(already_sent()),
        }
    }
}

fn io_error(path: &str) -> impl FnOnce(io::Error) -> LifecycleError + '_ {
    move |err| LifecycleError::file_io(path, err)
}

/// Write the archive into `writer`, polling `cancel` between members and between copy chunks.
///
/// `writer` is flushed after every member, so a [`MemberStream`] forwards each one as soon as
/// it is complete.
///
/// # Errors
/// Returns [`LifecycleError::Cancelled`] when cancelled, or the first zip or I/O failure.
pub fn write_archive<W: Write + Seek>(
    writer: W,
    contents: &ArchiveContents<'_>,
    store: &dyn BinaryStore,
    cancel: &CancellationFlag,
) -> Result<W, LifecycleError> {
    let mut zip = ZipWriter::new(writer);
    zip.set_flush_on_finish_file(true);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    cancel.check()?;
    zip.start_file(DATABASE_ENTRY, options)?;
    zip.write_all(contents.dump_bytes).map_err(io_error(DATABASE_ENTRY))?;

    cancel.check()?;
    let metadata = serde_json::to_vec_pretty(contents.metadata)
        .map_err(|err| LifecycleError::Archive(format!("cannot serialize metadata: {err}")))?;
    zip.start_file(METADATA_ENTRY, options)?;
    zip.write_all(&metadata).map_err(io_error(METADATA_ENTRY))?;

    let mut buffer = vec![0_u8; COPY_CHUNK];
    for relative_path in contents.files {
        cancel.check()?;
        let mut source = match store.open(relative_path) {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(path = %relative_path, error = %err, "file vanished before bundling; left out");
                continue;
            }
        };
        zip.start_file(format!("{UPLOADS_PREFIX}{relative_path}"), options)?;
        loop {
            cancel.check()?;
            let read = source.read(&mut buffer).map_err(io_error(relative_path))?;
            if read == 0 {
                break;
            }
            zip.write_all(&buffer[..read]).map_err(io_error(relative_path))?;
        }
    }

    cancel.check()?;
    Ok(zip.finish()?)
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, LifecycleError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(LifecycleError::Validation(format!("archive is missing {name}")));
        }
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry.read_to_end(&mut bytes).map_err(io_error(name))?;
    Ok(bytes)
}

/// An archive whose structure, checksum and counts have been verified.
pub struct LoadedArchive<R> {
    archive: ZipArchive<R>,
    pub metadata: Metadata,
    pub dump: DatabaseDump,
}

impl<R: Read + Seek> LoadedArchive<R> {
    /// Validate everything needed before a restore may touch any engine.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for structural problems and
    /// [`LifecycleError::ChecksumMismatch`] when the dump was altered.
    pub fn open(reader: R) -> Result<Self, LifecycleError> {
        let mut archive = ZipArchive::new(reader)
            .map_err(|err| LifecycleError::Validation(format!("not a readable zip archive: {err}")))?;

        let metadata_bytes = read_entry(&mut archive, METADATA_ENTRY)?;
        let metadata: Metadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|err| LifecycleError::Validation(format!("invalid {METADATA_ENTRY}: {err}")))?;
        metadata.check_format_version()?;

        let dump_bytes = read_entry(&mut archive, DATABASE_ENTRY)?;
        verify_sha256(&metadata.database.checksum_sha256, &dump_bytes)?;
        let dump = DatabaseDump::from_slice(&dump_bytes)
            .map_err(|err| LifecycleError::Validation(format!("invalid {DATABASE_ENTRY}: {err}")))?;
        metadata.verify_dump(&dump_bytes, &dump)?;

        Ok(Self { archive, metadata, dump })
    }

    /// Copy every bundled manifest file into `store`. Individual failures are collected, not raised.
    pub fn extract_files(&mut self, store: &dyn BinaryStore) -> FileRestoreSummary {
        let mut summary = FileRestoreSummary::default();
        let mut seen = BTreeSet::new();

        for entry in &self.metadata.images.manifest {
            if !seen.insert(entry.relative_path.as_str()) {
                continue;
            }
            let path = entry.relative_path.as_str();
            let member = entry.archive_path();

            if let Err(err) = safe_relative_path(path) {
                record_failure(&mut summary, path, err.to_string());
                continue;
            }
            let mut file = match self.archive.by_name(&member) {
                Ok(file) => file,
                // Missing at export time: the manifest records it with size 0 and nothing to copy.
                Err(ZipError::FileNotFound) if entry.file_size == 0 && !entry.is_orphan() => continue,
                Err(err) => {
                    record_failure(&mut summary, path, format!("cannot read {member}: {err}"));
                    continue;
                }
            };
            if file.enclosed_name().is_none() {
                let reason = format!("archive member {member} escapes the extraction root");
                record_failure(&mut summary, path, reason);
                continue;
            }
            match store.write(path, &mut file) {
                Ok(bytes) => {
                    tracing::debug!(path, bytes, "file restored");
                    summary.written += 1;
                }
                Err(err) => record_failure(&mut summary, path, err.to_string()),
            }
        }

        summary
    }
}

fn record_failure(summary: &mut FileRestoreSummary, path: &str, reason: String) {
    tracing::warn!(path, reason = %reason, "file not restored");
    summary.failed += 1;
    summary.failures.push(FileFailure { path: path.to_string(), reason });
}
