use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "SESSION_HARNESS_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("{} already exists", .0.display())]
    Exists(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub harness: HarnessConfig,
    pub reconnect: ReconnectConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auth_folder: String,
    /// Passed through to the sidecar; `None` keeps its built-in endpoint.
    pub socket_url: Option<String>,
    pub gateway_addr: String,
    pub version_url: String,
    pub version_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub max_msg_retry_count: u32,
    /// Distinct message ids whose retry counts are remembered.
    pub retry_cache_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_folder: "baileys_auth_info".to_string(),
            socket_url: None,
            gateway_addr: "127.0.0.1:8765".to_string(),
            version_url: "https://raw.githubusercontent.com/WhiskeySockets/Baileys/master/src/Defaults/baileys-version.json".to_string(),
            version_timeout_ms: 5000,
            send_timeout_ms: 30_000,
            max_msg_retry_count: 5,
            retry_cache_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub enabled: bool,
    pub dest_number: String,
    pub settle_delay_ms: u64,
    pub step_delay_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_number: "5515991426667".to_string(),
            settle_delay_ms: 2000,
            step_delay_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_pct: u8,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            jitter_pct: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub placeholder_fallback: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            placeholder_fallback: true,
        }
    }
}

impl HarnessConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw).map_err(|source| ConfigError::Parse {
                path: config_path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: config_path,
                    source,
                })
            }
        };

        config.apply_env_overrides(|name| env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Unprefixed legacy variables first, prefixed ones win.
    fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefixed = |name: &str| var(&format!("{ENV_PREFIX}{name}"));

        if let Some(val) = var("AUTH_FOLDER") {
            self.session.auth_folder = val;
        }
        if let Some(val) = var("DEST_NUMBER") {
            self.harness.dest_number = val;
        }
        if let Some(val) = var("SOCKET_URL") {
            self.session.socket_url = Some(val);
        }

        // Session settings
        if let Some(val) = prefixed("AUTH_FOLDER") {
            self.session.auth_folder = val;
        }
        if let Some(val) = prefixed("SOCKET_URL") {
            self.session.socket_url = Some(val);
        }
        if let Some(val) = prefixed("GATEWAY_ADDR") {
            self.session.gateway_addr = val;
        }
        if let Some(val) = prefixed("VERSION_URL") {
            self.session.version_url = val;
        }
        set_parsed(&mut self.session.version_timeout_ms, prefixed("VERSION_TIMEOUT_MS"));
        set_parsed(&mut self.session.send_timeout_ms, prefixed("SEND_TIMEOUT_MS"));
        set_parsed(&mut self.session.max_msg_retry_count, prefixed("MAX_MSG_RETRY_COUNT"));
        set_parsed(&mut self.session.retry_cache_capacity, prefixed("RETRY_CACHE_CAPACITY"));

        // Harness settings
        if let Some(val) = prefixed("DEST_NUMBER") {
            self.harness.dest_number = val;
        }
        if let Some(enabled) = prefixed("HARNESS_ENABLED").and_then(|v| parse_flag(&v)) {
            self.harness.enabled = enabled;
        }
        set_parsed(&mut self.harness.settle_delay_ms, prefixed("SETTLE_DELAY_MS"));
        set_parsed(&mut self.harness.step_delay_ms, prefixed("STEP_DELAY_MS"));

        // Reconnect settings
        set_parsed(&mut self.reconnect.initial_backoff_ms, prefixed("INITIAL_BACKOFF_MS"));
        set_parsed(&mut self.reconnect.max_backoff_ms, prefixed("MAX_BACKOFF_MS"));
        set_parsed(&mut self.reconnect.jitter_pct, prefixed("JITTER_PCT"));

        // History settings
        set_parsed(&mut self.history.capacity, prefixed("HISTORY_CAPACITY"));
        if let Some(fallback) =
            prefixed("HISTORY_PLACEHOLDER_FALLBACK").and_then(|v| parse_flag(&v))
        {
            self.history.placeholder_fallback = fallback;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.auth_folder.trim().is_empty() {
            return Err(ConfigError::Invalid("session.auth_folder must be set".into()));
        }
        if self.session.gateway_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("session.gateway_addr must be set".into()));
        }
        if self.session.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("session.send_timeout_ms must be non-zero".into()));
        }
        if self.harness.enabled {
            let dest = self.harness.dest_number.trim();
            if dest.is_empty() {
                return Err(ConfigError::Invalid(
                    "harness.dest_number is required when harness.enabled = true".into(),
                ));
            }
            let user = dest.split('@').next().unwrap_or_default();
            if user.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "harness.dest_number has no user part: {dest}"
                )));
            }
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_backoff_ms must be non-zero".into(),
            ));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_backoff_ms must be >= reconnect.initial_backoff_ms".into(),
            ));
        }
        if self.reconnect.jitter_pct > 100 {
            return Err(ConfigError::Invalid("reconnect.jitter_pct must be <= 100".into()));
        }
        if self.session.retry_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.retry_cache_capacity must be non-zero".into(),
            ));
        }
        if self.history.capacity == 0 {
            return Err(ConfigError::Invalid("history.capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::Exists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

/// Unparsable values leave the current setting alone.
fn set_parsed<T: FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|v| v.trim().parse().ok()) {
        *slot = value;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join("session-harness").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.harness.settle_delay(), Duration::from_millis(2000));
        assert_eq!(parsed.harness.step_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn legacy_env_names_apply_and_prefixed_names_win() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(overrides(&[
            ("AUTH_FOLDER", "legacy_auth"),
            ("DEST_NUMBER", "5511000000000"),
            ("SOCKET_URL", "wss://legacy.example.test"),
            ("SESSION_HARNESS_AUTH_FOLDER", "prefixed_auth"),
        ]));
        assert_eq!(cfg.session.auth_folder, "prefixed_auth");
        assert_eq!(cfg.harness.dest_number, "5511000000000");
        assert_eq!(cfg.session.socket_url.as_deref(), Some("wss://legacy.example.test"));
    }

    #[test]
    fn unparsable_numeric_override_is_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(overrides(&[("SESSION_HARNESS_STEP_DELAY_MS", "soon")]));
        assert_eq!(cfg.harness.step_delay_ms, 1500);
    }

    #[test]
    fn harness_flag_accepts_common_spellings_and_ignores_garbage() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(overrides(&[("SESSION_HARNESS_HARNESS_ENABLED", "0")]));
        assert!(!cfg.harness.enabled);
        cfg.apply_env_overrides(overrides(&[("SESSION_HARNESS_HARNESS_ENABLED", "maybe")]));
        assert!(!cfg.harness.enabled);
        cfg.apply_env_overrides(overrides(&[("SESSION_HARNESS_HARNESS_ENABLED", "Yes")]));
        assert!(cfg.harness.enabled);
    }

    #[test]
    fn every_tuning_field_has_an_env_override() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(overrides(&[
            ("SESSION_HARNESS_VERSION_TIMEOUT_MS", "750"),
            ("SESSION_HARNESS_MAX_MSG_RETRY_COUNT", "2"),
            ("SESSION_HARNESS_RETRY_CACHE_CAPACITY", "64"),
            ("SESSION_HARNESS_INITIAL_BACKOFF_MS", "250"),
            ("SESSION_HARNESS_JITTER_PCT", "5"),
            ("SESSION_HARNESS_HISTORY_CAPACITY", "32"),
            ("SESSION_HARNESS_HISTORY_PLACEHOLDER_FALLBACK", "off"),
        ]));
        assert_eq!(cfg.session.version_timeout_ms, 750);
        assert_eq!(cfg.session.max_msg_retry_count, 2);
        assert_eq!(cfg.session.retry_cache_capacity, 64);
        assert_eq!(cfg.reconnect.initial_backoff_ms, 250);
        assert_eq!(cfg.reconnect.jitter_pct, 5);
        assert_eq!(cfg.history.capacity, 32);
        assert!(!cfg.history.placeholder_fallback);
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_requires_destination_when_harness_enabled() {
        let mut cfg = Config::default();
        cfg.harness.dest_number = "  ".to_string();
        assert!(cfg.validate().is_err());
        cfg.harness.dest_number = "@s.whatsapp.net".to_string();
        assert!(cfg.validate().is_err());
        cfg.harness.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_backoff_bounds() {
        let mut cfg = Config::default();
        cfg.reconnect.max_backoff_ms = 10;
        assert!(cfg.validate().is_err());
        cfg.reconnect.max_backoff_ms = 30_000;
        cfg.reconnect.initial_backoff_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        Config::write_default(&path).unwrap();
        let err = Config::write_default(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Exists(_)));
    }
}
