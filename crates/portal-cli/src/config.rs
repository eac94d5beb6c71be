//! Startup configuration.
//!
//! Read once from `config/portal.toml` (optional), then overridden by
//! `PORTAL_*` environment variables. A `.env` file is loaded into the
//! environment before this runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use portal_api::ApiConfig;
use portal_auth::{CacheLocation, OidcConfig};

/// Session cache used when none is configured.
pub const DEFAULT_CACHE_PATH: &str = "data/portal-session.json";

/// Value of `cache.path` / `PORTAL_CACHE_PATH` selecting an in-memory cache.
const MEMORY_CACHE: &str = "memory";

/// Everything the binary needs to build a session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub auth: Option<OidcConfig>,
    pub api: ApiConfig,
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Session cache file, or `memory`.
    pub path: Option<String>,
}

impl PortalConfig {
    /// Load `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_overrides(env_non_empty);
        Ok(config)
    }

    /// Apply `PORTAL_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let auth = self
            .auth
            .get_or_insert_with(|| OidcConfig::new(String::new(), String::new()));

        if let Some(v) = lookup("PORTAL_CLIENT_ID") {
            auth.client_id = v;
        }
        if let Some(v) = lookup("PORTAL_TENANT_ID") {
            auth.tenant_id = v;
        }
        if let Some(v) = lookup("PORTAL_AUTHORITY") {
            auth.authority = Some(v);
        }
        if let Some(v) = lookup("PORTAL_REDIRECT_URI") {
            auth.redirect_uri = v;
        }
        if let Some(v) = lookup("PORTAL_API_SCOPE") {
            self.api.api_scope = v;
        }
        if let Some(v) = lookup("PORTAL_API_URL") {
            self.api.api_base_url = v;
        }
        if let Some(v) = lookup("PORTAL_GRAPH_URL") {
            self.api.graph_endpoint = v;
        }
        if let Some(v) = lookup("PORTAL_CACHE_PATH") {
            self.cache.path = Some(v);
        }
    }

    /// The identity-provider settings, validated.
    pub fn oidc(&self) -> Result<OidcConfig> {
        let auth = self
            .auth
            .clone()
            .unwrap_or_else(|| OidcConfig::new(String::new(), String::new()));
        auth.validate()
            .context("set PORTAL_CLIENT_ID and PORTAL_TENANT_ID or the [auth] section")?;
        Ok(auth)
    }

    pub fn cache_location(&self) -> CacheLocation {
        match self.cache.path.as_deref() {
            Some(MEMORY_CACHE) => CacheLocation::Memory,
            Some(path) => CacheLocation::Session(PathBuf::from(path)),
            None => CacheLocation::Session(PathBuf::from(DEFAULT_CACHE_PATH)),
        }
    }
}

/// Read a non-empty environment variable, returning `None` if unset or empty.
fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
