use std::fmt;
use std::path::PathBuf;

use assetso_lifecycle_core::{EngineKind, ADMIN_EMAIL};
use assetso_lifecycle_store_rest::{RestConfig, DEFAULT_PAGE_SIZE};
use assetso_lifecycle_store_sqlite::{DatabaseUrl, UrlScheme};

use crate::LifecycleError;

pub const DEFAULT_ENGINE_PRIORITY: &str = "direct,rest,orm";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

/// Command-line and environment settings shared by the service and the CLI.
#[derive(Debug, Clone, clap::Args)]
pub struct ConfigArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
    #[arg(long, env = "REST_URL")]
    pub rest_url: Option<String>,
    #[arg(long, env = "REST_SERVICE_KEY", hide_env_values = true)]
    pub rest_service_key: Option<String>,
    #[arg(long, env = "REST_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub rest_page_size: usize,
    #[arg(long, env = "ENGINE_PRIORITY", default_value = DEFAULT_ENGINE_PRIORITY)]
    pub engine_priority: String,
    #[arg(long, env = "UPLOADS_DIR", default_value = "./uploads")]
    pub uploads_dir: PathBuf,
    #[arg(
        long,
        env = "ADMIN_DEFAULT_PASSWORD",
        default_value = DEFAULT_ADMIN_PASSWORD,
        hide_env_values = true,
        hide_default_value = true
    )]
    pub admin_default_password: String,
}

impl ConfigArgs {
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] for an unparseable engine priority or an empty
    /// admin password.
    pub fn resolve(&self) -> Result<LifecycleConfig, LifecycleError> {
        let priority = parse_priority(&self.engine_priority)?;
        let rest = match (non_empty(self.rest_url.as_deref()), non_empty(self.rest_service_key.as_deref()))
        {
            (Some(url), Some(key)) => {
                let mut config = RestConfig::new(url, key);
                config.page_size = self.rest_page_size.max(1);
                Some(config)
            }
            _ => None,
        };
        if self.admin_default_password.is_empty() {
            return Err(LifecycleError::Configuration(
                "ADMIN_DEFAULT_PASSWORD must not be empty".to_string(),
            ));
        }

        Ok(LifecycleConfig {
            engines: EngineConfig {
                database_url: non_empty(self.database_url.as_deref()).map(str::to_string),
                rest,
                priority,
            },
            uploads_dir: self.uploads_dir.clone(),
            admin: AdminSeed::new(self.admin_default_password.clone()),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Resolved, immutable settings for one process.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub engines: EngineConfig,
    pub uploads_dir: PathBuf,
    pub admin: AdminSeed,
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub rest: Option<RestConfig>,
    pub priority: Vec<EngineKind>,
}

impl EngineConfig {
    /// Local path for `kind` when the database URL can serve it.
    #[must_use]
    pub fn local_path(&self, kind: EngineKind) -> Option<PathBuf> {
        let url = DatabaseUrl::parse(self.database_url.as_deref()?)?;
        match (kind, url.scheme) {
            (EngineKind::Direct, UrlScheme::Sqlite)
            | (EngineKind::Orm, UrlScheme::Sqlite | UrlScheme::File) => Some(url.path),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_satisfied(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Direct | EngineKind::Orm => self.local_path(kind).is_some(),
            EngineKind::Rest => self.rest.is_some(),
        }
    }

    /// Engines whose prerequisites are present, in priority order.
    #[must_use]
    pub fn ranked(&self) -> Vec<EngineKind> {
        self.priority.iter().copied().filter(|kind| self.is_satisfied(*kind)).collect()
    }
}

/// The well-known administrative account a clean always leaves behind.
#[derive(Clone)]
pub struct AdminSeed {
    pub email: String,
    pub name: String,
    pub password: String,
}

impl AdminSeed {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            email: ADMIN_EMAIL.to_string(),
            name: "Administrator".to_string(),
            password: password.into(),
        }
    }
}

impl Default for AdminSeed {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN_PASSWORD)
    }
}

impl fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminSeed")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parse a comma-separated engine ranking; duplicates keep their first position.
///
/// # Errors
/// Returns [`LifecycleError::Configuration`] for unknown names or an empty list.
pub fn parse_priority(raw: &str) -> Result<Vec<EngineKind>, LifecycleError> {
    let mut priority = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let kind = EngineKind::parse(&name.to_ascii_lowercase()).ok_or_else(|| {
            LifecycleError::Configuration(format!(
                "unknown engine {name:?} in ENGINE_PRIORITY; expected direct, rest or orm"
            ))
        })?;
        if !priority.contains(&kind) {
            priority.push(kind);
        }
    }
    if priority.is_empty() {
        return Err(LifecycleError::Configuration("ENGINE_PRIORITY lists no engines".to_string()));
    }
    Ok(priority)
}
