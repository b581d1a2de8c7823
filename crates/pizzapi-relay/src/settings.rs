//! Relay configuration.
//!
//! Settings come from an optional TOML file (deploy-level knobs: trusted
//! origins, database path, auth provider) overlaid with environment
//! variables (the operational knobs every install tunes). Environment always
//! wins.

use anyhow::{Context, Result};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Values accepted in `PIZZAPI_REDIS_URL` to run without a shared store.
const REDIS_DISABLED: &[&str] = &["off", "disabled", "none"];

/// Deploy-level settings read from the config file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileSettings {
    /// Origins allowed to open viewer/terminal/hub sockets.
    pub trusted_origins: Vec<String>,
    /// SQLite database path. Defaults next to the attachment dir.
    pub database_path: Option<PathBuf>,
    /// Base URL of the auth provider used for API keys and cookies.
    pub auth_provider_url: Option<String>,
    /// Base URL stamped into session share links.
    pub share_url_base: Option<String>,
    /// Name of the browser session cookie.
    pub session_cookie: Option<String>,
}

/// Multi-tenant gate configuration. Present only when the relay serves a
/// single org behind the control plane.
#[derive(Debug, Clone)]
pub struct OrgSettings {
    pub org_id: String,
    pub org_slug: String,
    pub jwks_url: String,
}

/// Web-push signing material.
#[derive(Debug, Clone)]
pub struct VapidSettings {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

/// Fully resolved relay settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub port: u16,
    /// None disables the shared store and runs single-node in-memory.
    pub redis_url: Option<String>,
    /// Key namespace for multi-tenant deployments.
    pub redis_prefix: Option<String>,
    pub org: Option<OrgSettings>,
    pub ephemeral_ttl: Duration,
    pub sweep_interval: Duration,
    pub event_buffer_size: usize,
    pub event_ttl: Duration,
    pub attachment_ttl: Duration,
    pub attachment_max_bytes: u64,
    pub attachment_dir: PathBuf,
    pub vapid: Option<VapidSettings>,
    pub trusted_origins: Vec<String>,
    pub database_path: PathBuf,
    pub auth_provider_url: Option<String>,
    pub share_url_base: String,
    pub session_cookie: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            port: 8787,
            redis_url: None,
            redis_prefix: None,
            org: None,
            ephemeral_ttl: Duration::from_millis(600_000),
            sweep_interval: Duration::from_millis(60_000),
            event_buffer_size: 1_000,
            event_ttl: Duration::from_millis(86_400_000),
            attachment_ttl: Duration::from_millis(900_000),
            attachment_max_bytes: 20 * 1024 * 1024,
            attachment_dir: PathBuf::from("attachments"),
            vapid: None,
            trusted_origins: Vec::new(),
            database_path: PathBuf::from("pizzapi-relay.db"),
            auth_provider_url: None,
            share_url_base: "http://localhost:8787".to_string(),
            session_cookie: "pizzapi.sid".to_string(),
        }
    }
}

impl RelaySettings {
    /// Load settings from the given config file (or the default location)
    /// overlaid with environment variables.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let file = load_file_settings(config_path)?;
        let mut settings = Self::default();

        if !file.trusted_origins.is_empty() {
            settings.trusted_origins = file.trusted_origins;
        }
        if let Some(path) = file.database_path {
            settings.database_path = path;
        }
        settings.auth_provider_url = file.auth_provider_url;
        if let Some(base) = file.share_url_base {
            settings.share_url_base = base;
        }
        if let Some(cookie) = file.session_cookie {
            settings.session_cookie = cookie;
        }

        settings.apply_env()?;
        Ok(settings)
    }

    /// Overlay environment variables onto the current values.
    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_var("PORT") {
            self.port = port.parse().context("parsing PORT")?;
        }

        self.redis_url = match env_var("PIZZAPI_REDIS_URL") {
            Some(url) if REDIS_DISABLED.contains(&url.to_lowercase().as_str()) => None,
            Some(url) => Some(url),
            None => None,
        };
        self.redis_prefix = env_var("REDIS_PREFIX");

        self.org = match (env_var("ORG_ID"), env_var("JWT_JWKS_URL")) {
            (Some(org_id), Some(jwks_url)) => Some(OrgSettings {
                org_id,
                jwks_url,
                org_slug: env_var("ORG_SLUG").unwrap_or_default(),
            }),
            _ => None,
        };

        if let Some(ms) = env_duration_ms("PIZZAPI_EPHEMERAL_TTL_MS")? {
            self.ephemeral_ttl = ms;
        }
        if let Some(ms) = env_duration_ms("PIZZAPI_EPHEMERAL_SWEEP_MS")? {
            self.sweep_interval = ms;
        }
        if let Some(size) = env_var("PIZZAPI_RELAY_EVENT_BUFFER_SIZE") {
            self.event_buffer_size = size
                .parse()
                .context("parsing PIZZAPI_RELAY_EVENT_BUFFER_SIZE")?;
        }
        if let Some(ms) = env_duration_ms("PIZZAPI_RELAY_EVENT_TTL_MS")? {
            self.event_ttl = ms;
        }
        if let Some(ms) = env_duration_ms("PIZZAPI_ATTACHMENT_TTL_MS")? {
            self.attachment_ttl = ms;
        }
        if let Some(bytes) = env_var("PIZZAPI_ATTACHMENT_MAX_FILE_SIZE_BYTES") {
            self.attachment_max_bytes = bytes
                .parse()
                .context("parsing PIZZAPI_ATTACHMENT_MAX_FILE_SIZE_BYTES")?;
        }
        if let Some(dir) = env_var("PIZZAPI_ATTACHMENT_DIR") {
            self.attachment_dir = PathBuf::from(dir);
        }

        self.vapid = match (
            env_var("VAPID_PUBLIC_KEY"),
            env_var("VAPID_PRIVATE_KEY"),
        ) {
            (Some(public_key), Some(private_key)) => Some(VapidSettings {
                public_key,
                private_key,
                subject: env_var("VAPID_SUBJECT")
                    .unwrap_or_else(|| "mailto:admin@pizzapi.dev".to_string()),
            }),
            _ => None,
        };

        Ok(())
    }

    /// Whether this deployment runs behind the control plane.
    pub fn is_multi_tenant(&self) -> bool {
        self.org.is_some()
    }
}

fn load_file_settings(config_path: Option<&PathBuf>) -> Result<FileSettings> {
    let path = match config_path {
        Some(path) => Some(path.clone()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let Some(path) = path else {
        return Ok(FileSettings::default());
    };

    let config = Config::builder()
        .add_source(File::from(path.clone()).format(FileFormat::Toml))
        .build()
        .with_context(|| format!("reading config file: {}", path.display()))?;

    config
        .try_deserialize()
        .with_context(|| format!("parsing config file: {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pizzapi").join("relay.toml"))
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_duration_ms(name: &str) -> Result<Option<Duration>> {
    match env_var(name) {
        Some(value) => {
            let ms: u64 = value.parse().with_context(|| format!("parsing {name}"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = RelaySettings::default();
        assert_eq!(settings.ephemeral_ttl, Duration::from_millis(600_000));
        assert_eq!(settings.sweep_interval, Duration::from_millis(60_000));
        assert_eq!(settings.event_buffer_size, 1_000);
        assert_eq!(settings.attachment_max_bytes, 20 * 1024 * 1024);
        assert!(settings.redis_url.is_none());
        assert!(!settings.is_multi_tenant());
    }

    #[test]
    fn redis_disabled_values() {
        for value in ["off", "disabled", "none", "OFF"] {
            assert!(REDIS_DISABLED.contains(&value.to_lowercase().as_str()));
        }
    }
}
