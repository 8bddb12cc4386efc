use std::collections::BTreeSet;

use assetso_lifecycle_core::{
    table_spec, DatabaseDump, ImageSummary, ManifestEntry, Row, ORPHANED_FILE_ID, UPLOADS_PREFIX,
};
use serde_json::Value;

use crate::binary_store::{normalize_reference, BinaryStore, ImageReference};
use crate::LifecycleError;

/// Manifest plus the distinct store paths to bundle, in bundling order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectedAssets {
    pub images: ImageSummary,
    pub files: Vec<String>,
}

fn file_name(relative_path: &str) -> String {
    relative_path.rsplit('/').next().unwrap_or(relative_path).to_string()
}

fn cell_text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Cross-reference every image column in `dump` with the files in `store`.
///
/// `referenced` and `skipped` count referencing rows. Each distinct local path is resolved once
/// and yields one manifest entry, credited to the first row that names it, and one tick of
/// `included` or `missing`. Store files nobody references are bundled as orphans.
///
/// # Errors
/// Returns [`LifecycleError::FileIo`] when the store cannot be listed.
pub fn collect_assets(
    dump: &DatabaseDump,
    store: &dyn BinaryStore,
) -> Result<CollectedAssets, LifecycleError> {
    let mut images = ImageSummary::default();
    let mut files = Vec::new();
    let mut bundled = BTreeSet::new();
    let mut resolved = BTreeSet::new();

    for table in dump.tables() {
        let Some(column) = table_spec(&table.name).and_then(|spec| spec.image_column) else {
            continue;
        };
        for row in &table.rows {
            let Some(image_url) = cell_text(row, column) else {
                continue;
            };
            let Some(reference) = normalize_reference(&image_url) else {
                continue;
            };
            images.referenced += 1;
            let asset_id = cell_text(row, "id").unwrap_or_default();

            let relative_path = match reference {
                ImageReference::External => {
                    images.skipped += 1;
                    continue;
                }
                ImageReference::Unsafe => {
                    tracing::warn!(table = %table.name, asset_id = %asset_id, image_url = %image_url, "image path escapes the store; skipped");
                    images.skipped += 1;
                    continue;
                }
                ImageReference::Local(path) => path,
            };
            if !resolved.insert(relative_path.clone()) {
                continue;
            }

            let size = match store.stat(&relative_path) {
                Ok(size) => size,
                Err(err) => {
                    tracing::warn!(path = %relative_path, error = %err, "cannot stat image; counting it missing");
                    None
                }
            };
            let file_size = if let Some(size) = size {
                images.included += 1;
                if bundled.insert(relative_path.clone()) {
                    files.push(relative_path.clone());
                }
                size
            } else {
                tracing::warn!(asset_id = %asset_id, path = %relative_path, "referenced image missing from store");
                images.missing += 1;
                0
            };

            images.manifest.push(ManifestEntry {
                asset_id,
                image_url,
                file_name: file_name(&relative_path),
                relative_path,
                file_size,
            });
        }
    }

    let stored = store.list().map_err(|err| LifecycleError::file_io("<store root>", err))?;
    for file in stored {
        if bundled.contains(&file.relative_path) {
            continue;
        }
        images.orphaned += 1;
        bundled.insert(file.relative_path.clone());
        files.push(file.relative_path.clone());
        images.manifest.push(ManifestEntry {
            asset_id: ORPHANED_FILE_ID.to_string(),
            image_url: format!("/{UPLOADS_PREFIX}{}", file.relative_path),
            file_name: file_name(&file.relative_path),
            relative_path: file.relative_path,
            file_size: file.size,
        });
    }

    images.unique_files = files.len();
    Ok(CollectedAssets { images, files })
}
