use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const ARCHIVE_FORMAT_VERSION: u32 = 1;
pub const DATABASE_ENTRY: &str = "database.json";
pub const METADATA_ENTRY: &str = "metadata.json";
pub const UPLOADS_PREFIX: &str = "uploads/";
pub const ORPHANED_FILE_ID: &str = "orphaned-file";
pub const ADMIN_EMAIL: &str = "admin@assetso.com";
pub const ADMIN_ROLE: &str = "ADMIN";

/// One row of a logical table: column name to scalar, null, or JSON text.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Direct,
    Rest,
    Orm,
}

impl EngineKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Rest => "rest",
            Self::Orm => "orm",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(Self::Direct),
            "rest" => Some(Self::Rest),
            "orm" => Some(Self::Orm),
            _ => None,
        }
    }
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of failure kinds every engine adapter maps its native errors into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    NotFound,
    ConnectionFailed,
    ConstraintViolation,
    Other,
}

impl EngineErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ConnectionFailed => "connection_failed",
            Self::ConstraintViolation => "constraint_violation",
            Self::Other => "other",
        }
    }
}

impl Display for EngineErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ConnectionFailed, message)
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ConstraintViolation, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Other, message)
    }

    /// True when the engine reported that the table (relation) does not exist.
    #[must_use]
    pub fn is_missing_table(&self) -> bool {
        self.kind == EngineErrorKind::NotFound
    }
}

/// Static description of one logical table in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub key: &'static [&'static str],
    pub depends_on: &'static [&'static str],
    pub columns: &'static [&'static str],
    /// Columns a restore writes on insert but never overwrites on an existing row.
    pub insert_only: &'static [&'static str],
    /// Columns holding a `users.id`.
    pub user_columns: &'static [&'static str],
    pub image_column: Option<&'static str>,
}

impl TableSpec {
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|candidate| *candidate == column)
    }
}

pub const USERS: &str = "users";
pub const DEPARTMENTS: &str = "departments";
pub const SITES: &str = "sites";
pub const CATEGORIES: &str = "categories";
pub const ASSETS: &str = "assets";
pub const ASSET_CHECKOUTS: &str = "asset_checkouts";
pub const STOCK_OPNAME_SESSIONS: &str = "stock_opname_sessions";
pub const STOCK_OPNAME_ENTRIES: &str = "stock_opname_entries";
pub const LOGS: &str = "logs";

// Forward dependency order. Deletion walks it backwards.
static CATALOG: [TableSpec; 9] = [
    TableSpec {
        name: USERS,
        key: &["email"],
        depends_on: &[],
        columns: &[
            "id",
            "email",
            "name",
            "password",
            "role",
            "department",
            "is_active",
            "created_at",
            "updated_at",
        ],
        // Rows are matched by email, so the target keeps its own id.
        insert_only: &["id", "created_at"],
        user_columns: &[],
        image_column: None,
    },
    TableSpec {
        name: DEPARTMENTS,
        key: &["id"],
        depends_on: &[],
        columns: &["id", "name", "code", "created_at", "updated_at"],
        insert_only: &[],
        user_columns: &[],
        image_column: None,
    },
    TableSpec {
        name: SITES,
        key: &["id"],
        depends_on: &[],
        columns: &["id", "name", "address", "created_at", "updated_at"],
        insert_only: &[],
        user_columns: &[],
        image_column: None,
    },
    TableSpec {
        name: CATEGORIES,
        key: &["id"],
        depends_on: &[],
        columns: &["id", "name", "description", "created_at", "updated_at"],
        insert_only: &[],
        user_columns: &[],
        image_column: None,
    },
    TableSpec {
        name: ASSETS,
        key: &["id"],
        depends_on: &[CATEGORIES, SITES, DEPARTMENTS],
        columns: &[
            "id",
            "code",
            "name",
            "category_id",
            "site_id",
            "department_id",
            "status",
            "image_url",
            "purchase_date",
            "price",
            "notes",
            "created_at",
            "updated_at",
        ],
        insert_only: &[],
        user_columns: &[],
        image_column: Some("image_url"),
    },
    TableSpec {
        name: ASSET_CHECKOUTS,
        key: &["id"],
        depends_on: &[ASSETS, USERS],
        columns: &[
            "id",
            "asset_id",
            "user_id",
            "checked_out_at",
            "due_at",
            "checked_in_at",
            "notes",
            "created_at",
        ],
        insert_only: &[],
        user_columns: &["user_id"],
        image_column: None,
    },
    TableSpec {
        name: STOCK_OPNAME_SESSIONS,
        key: &["id"],
        depends_on: &[SITES, USERS],
        columns: &[
            "id",
            "name",
            "site_id",
            "status",
            "started_by",
            "started_at",
            "completed_at",
            "created_at",
        ],
        insert_only: &[],
        user_columns: &["started_by"],
        image_column: None,
    },
    TableSpec {
        name: STOCK_OPNAME_ENTRIES,
        key: &["id"],
        depends_on: &[STOCK_OPNAME_SESSIONS, ASSETS, USERS],
        columns: &[
            "id",
            "session_id",
            "asset_id",
            "scanned_by",
            "condition",
            "found",
            "notes",
            "scanned_at",
        ],
        insert_only: &[],
        user_columns: &["scanned_by"],
        image_column: None,
    },
    TableSpec {
        name: LOGS,
        key: &["id"],
        depends_on: &[USERS],
        columns: &["id", "user_id", "action", "entity", "entity_id", "details", "created_at"],
        insert_only: &[],
        user_columns: &["user_id"],
        image_column: None,
    },
];

#[must_use]
pub fn catalog() -> &'static [TableSpec] {
    &CATALOG
}

#[must_use]
pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// Dependencies first: a table is never visited before a table it references.
pub fn restore_order() -> impl Iterator<Item = &'static TableSpec> {
    CATALOG.iter()
}

/// Dependents first: the exact reverse of [`restore_order`].
pub fn deletion_order() -> impl Iterator<Item = &'static TableSpec> {
    CATALOG.iter().rev()
}

/// Check that `tables` is a valid topological order with well-formed keys.
///
/// # Errors
/// Returns [`CoreError::Catalog`] naming the first violated rule.
pub fn validate_catalog(tables: &[TableSpec]) -> Result<(), CoreError> {
    let mut seen = BTreeSet::new();
    for spec in tables {
        if !is_valid_identifier(spec.name) {
            return Err(CoreError::Catalog(format!("invalid table name: {}", spec.name)));
        }
        if spec.key.is_empty() {
            return Err(CoreError::Catalog(format!("table {} has no natural key", spec.name)));
        }
        let declared = spec
            .key
            .iter()
            .chain(spec.insert_only)
            .chain(spec.user_columns)
            .chain(spec.image_column.iter());
        for column in declared {
            if !spec.has_column(column) {
                return Err(CoreError::Catalog(format!(
                    "table {} references undeclared column {column}",
                    spec.name
                )));
            }
        }
        if !spec.user_columns.is_empty() && !spec.depends_on.contains(&USERS) {
            return Err(CoreError::Catalog(format!(
                "table {} holds user ids but does not depend on {USERS}",
                spec.name
            )));
        }
        for dependency in spec.depends_on {
            if !seen.contains(dependency) {
                return Err(CoreError::Catalog(format!(
                    "table {} depends on {dependency}, which is not restored before it",
                    spec.name
                )));
            }
        }
        if !seen.insert(spec.name) {
            return Err(CoreError::Catalog(format!("duplicate table: {}", spec.name)));
        }
    }
    Ok(())
}

/// SQL-safe identifier: `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub name: String,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self { name: name.into(), rows }
    }
}

/// Snapshot of every tracked table. Serializes as a JSON object whose key order is the
/// insertion order of the tables.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseDump {
    tables: Vec<Table>,
}

impl DatabaseDump {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a table, replacing any earlier table of the same name in place.
    pub fn push(&mut self, table: Table) {
        if let Some(existing) = self.tables.iter_mut().find(|t| t.name == table.name) {
            *existing = table;
        } else {
            self.tables.push(table);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    #[must_use]
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    #[must_use]
    pub fn table_counts(&self) -> BTreeMap<String, usize> {
        self.tables.iter().map(|table| (table.name.clone(), table.rows.len())).collect()
    }

    #[must_use]
    pub fn total_records(&self) -> usize {
        self.tables.iter().map(|table| table.rows.len()).sum()
    }

    /// The exact byte serialization the archive checksum is computed over.
    ///
    /// # Errors
    /// Returns an error when a row value cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// # Errors
    /// Returns an error when `bytes` is not a JSON object of table name to row arrays.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Serialize for DatabaseDump {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.tables.len()))?;
        for table in &self.tables {
            map.serialize_entry(&table.name, &table.rows)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DatabaseDump {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DumpVisitor;

        impl<'de> Visitor<'de> for DumpVisitor {
            type Value = DatabaseDump;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a map of table name to an array of row objects")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut tables: Vec<Table> = Vec::new();
                while let Some((name, rows)) = access.next_entry::<String, Vec<Row>>()? {
                    if tables.iter().any(|table| table.name == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate table in dump: {name}"
                        )));
                    }
                    tables.push(Table { name, rows });
                }
                Ok(DatabaseDump { tables })
            }
        }

        deserializer.deserialize_map(DumpVisitor)
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Recompute the SHA-256 of `bytes` and compare it against `expected`.
///
/// # Errors
/// Returns [`CoreError::ChecksumMismatch`] when the digests differ.
pub fn verify_sha256(expected: &str, bytes: &[u8]) -> Result<(), CoreError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(CoreError::ChecksumMismatch { expected: expected.to_string(), actual })
    }
}

fn default_format_version() -> u32 {
    ARCHIVE_FORMAT_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub name: String,
    pub exported_at: String,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    pub total_records: usize,
    pub table_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub missing_tables: Vec<String>,
    pub database: DatabaseDigest,
    pub images: ImageSummary,
}

impl Metadata {
    /// Check the dump bytes and parsed dump against what this metadata promises.
    ///
    /// # Errors
    /// Returns [`CoreError::ChecksumMismatch`] for a digest mismatch and
    /// [`CoreError::Validation`] for version or count disagreements.
    pub fn verify_dump(&self, bytes: &[u8], dump: &DatabaseDump) -> Result<(), CoreError> {
        verify_sha256(&self.database.checksum_sha256, bytes)?;
        let counts = dump.table_counts();
        for (table, expected) in &self.table_counts {
            let actual = counts.get(table).copied().unwrap_or(0);
            if actual != *expected {
                return Err(CoreError::Validation(format!(
                    "table count mismatch for {table}: metadata says {expected}, dump has {actual}"
                )));
            }
        }
        if dump.total_records() != self.total_records {
            return Err(CoreError::Validation(format!(
                "total record mismatch: metadata says {}, dump has {}",
                self.total_records,
                dump.total_records()
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when the archive was written by a newer format.
    pub fn check_format_version(&self) -> Result<(), CoreError> {
        if self.format_version == 0 || self.format_version > ARCHIVE_FORMAT_VERSION {
            return Err(CoreError::Validation(format!(
                "unsupported archive format version {}; supported range is 1..={ARCHIVE_FORMAT_VERSION}",
                self.format_version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDigest {
    pub file_size_bytes: u64,
    pub checksum_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub referenced: usize,
    pub included: usize,
    pub unique_files: usize,
    pub missing: usize,
    pub skipped: usize,
    pub orphaned: usize,
    pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub asset_id: String,
    pub image_url: String,
    pub relative_path: String,
    pub file_name: String,
    pub file_size: u64,
}

impl ManifestEntry {
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.asset_id == ORPHANED_FILE_ID
    }

    /// Archive member name of the bundled file.
    #[must_use]
    pub fn archive_path(&self) -> String {
        format!("{UPLOADS_PREFIX}{}", self.relative_path)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    Transactional,
    BestEffort,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Complete,
    RolledBack,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileRestoreSummary {
    pub written: usize,
    pub failed: usize,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    pub engine: EngineKind,
    pub mode: RestoreMode,
    pub status: RestoreStatus,
    pub tables: BTreeMap<String, usize>,
    pub missing_tables: Vec<String>,
    pub ignored_tables: Vec<String>,
    /// Archive users matched by email to a target row with a different id.
    #[serde(default)]
    pub remapped_users: usize,
    pub files: FileRestoreSummary,
}

impl RestoreSummary {
    #[must_use]
    pub fn new(engine: EngineKind, mode: RestoreMode) -> Self {
        Self {
            engine,
            mode,
            status: RestoreStatus::Complete,
            tables: BTreeMap::new(),
            missing_tables: Vec::new(),
            ignored_tables: Vec::new(),
            remapped_users: 0,
            files: FileRestoreSummary::default(),
        }
    }

    pub fn add_rows(&mut self, table: &str, rows: usize) {
        *self.tables.entry(table.to_string()).or_insert(0) += rows;
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.values().sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CleanStatus {
    Done,
    RolledBack,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanSummary {
    pub engine: EngineKind,
    pub status: CleanStatus,
    pub tables: BTreeMap<String, usize>,
    pub missing_tables: Vec<String>,
    pub admin_reseeded: bool,
}

impl CleanSummary {
    #[must_use]
    pub fn new(engine: EngineKind) -> Self {
        Self {
            engine,
            status: CleanStatus::Done,
            tables: BTreeMap::new(),
            missing_tables: Vec::new(),
            admin_reseeded: false,
        }
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteFilter {
    All,
    /// Rows whose `column` is not `value`; rows where it is NULL are deleted too.
    NotEqual { column: &'static str, value: String },
}

/// Insert-or-update of `rows` keyed on `conflict_key`.
///
/// `insert_only` columns are written when a row is inserted and left alone when an existing row
/// is updated.
#[derive(Debug, Clone, Copy)]
pub struct Upsert<'a> {
    pub table: &'a TableSpec,
    pub conflict_key: &'a [&'a str],
    pub insert_only: &'a [&'a str],
    pub rows: &'a [Row],
}

impl<'a> Upsert<'a> {
    #[must_use]
    pub fn by_natural_key(table: &'a TableSpec, rows: &'a [Row]) -> Self {
        Self { table, conflict_key: table.key, insert_only: table.insert_only, rows }
    }

    /// Columns refreshed when the row already exists.
    #[must_use]
    pub fn is_update_column(&self, column: &str) -> bool {
        !self.conflict_key.contains(&column) && !self.insert_only.contains(&column)
    }
}

/// Mutations available inside one unit of work.
pub trait TableWriter {
    /// Rows of `table` as this unit of work currently sees them.
    ///
    /// # Errors
    /// Returns the adapter's classified error; `NotFound` when the table is absent.
    fn read(&mut self, table: &TableSpec) -> Result<Vec<Row>, EngineError>;

    /// # Errors
    /// Returns the adapter's classified error; `NotFound` when the table is absent.
    fn write_batch(&mut self, upsert: &Upsert<'_>) -> Result<usize, EngineError>;

    /// # Errors
    /// Returns the adapter's classified error; `NotFound` when the table is absent.
    fn delete_where(&mut self, table: &TableSpec, filter: &DeleteFilter)
        -> Result<usize, EngineError>;
}

pub type UnitOfWork<'w> = dyn FnMut(&mut dyn TableWriter) -> Result<(), EngineError> + 'w;

/// Capability interface shared by every storage backend.
pub trait StorageEngine {
    fn kind(&self) -> EngineKind;

    /// Whether [`StorageEngine::unit_of_work`] is all-or-nothing.
    fn supports_transactions(&self) -> bool;

    /// # Errors
    /// Returns `NotFound` when the table does not exist, or another classified error.
    fn read(&self, table: &TableSpec) -> Result<Vec<Row>, EngineError>;

    /// Run `work` against this engine. Transactional engines commit when `work` returns `Ok`
    /// and roll back otherwise; non-transactional engines apply each call immediately.
    ///
    /// # Errors
    /// Returns the error from `work`, or a begin/commit failure.
    fn unit_of_work(&self, work: &mut UnitOfWork<'_>) -> Result<(), EngineError>;
}
