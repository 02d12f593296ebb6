use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connection]
//                    max_reconnect_attempts = 8
//
//   env var:         PORTAL_CHAT_CONNECTION__MAX_RECONNECT_ATTEMPTS=8
//
// Double underscore nests into a section; single underscores stay in field names.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Backend endpoints (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// Base URL of the request/response API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Base URL of the realtime endpoint. Derived from `base_url` when unset.
    #[serde(default)]
    pub ws_base_url: Option<String>,
    /// Sent as `Authorization: Token <api_token>` on both transports.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_base_url: None,
            api_token: None,
        }
    }
}

impl ServerFileConfig {
    pub fn realtime_base_url(&self) -> &str {
        self.ws_base_url.as_deref().unwrap_or(&self.base_url)
    }
}

/// Channel tunables (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            typing_timeout_ms: default_typing_timeout_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_typing_timeout_ms() -> u64 {
    3000
}

/// Build a figment that layers: defaults → config.toml → PORTAL_CHAT_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("PORTAL_CHAT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Reconnect policy of a single [`crate::ConnectionManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Delay before the first reconnect attempt; doubles on each further one.
    pub base_delay: Duration,
    /// Reconnect attempts allowed after an abnormal close before giving up.
    pub max_attempts: u32,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(fc.reconnect_base_delay_ms),
            max_attempts: fc.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

/// Settings of the [`crate::SessionCoordinator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// A typing indicator clears itself after this long without a refresh.
    pub typing_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl CoordinatorConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            typing_timeout: Duration::from_millis(fc.typing_timeout_ms),
            connection: ConnectionConfig::from_file(fc),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --config-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientDirs {
    pub config_dir: PathBuf,
}

impl ClientDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("could not find home directory")?
                .join(".portal-chat"),
        };

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create config directory: {:?}", config_dir))?;

        debug!("Config directory: {}", config_dir.display());

        Ok(Self { config_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}
