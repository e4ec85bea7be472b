use crate::session::UiMode;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "KIOSK_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub protocol: ProtocolConfig,
    pub mock: MockConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: String,
    pub retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://192.168.0.101:7580/ws-link/websocket".to_string(),
            retry_delay_ms: 5000,
        }
    }
}

/// Which wire dialect the backend speaks: the plain message channel, or the
/// subscribe/publish overlay that needs a handshake per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    #[default]
    Plain,
    Relay,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProtocolConfig {
    pub variant: ProtocolVariant,
    pub subscribe_destination: Option<String>,
}

impl ProtocolConfig {
    /// Handshake destination the transport replays on every open; only the
    /// relay variant has one.
    pub fn handshake_destination(&self) -> Option<String> {
        match self.variant {
            ProtocolVariant::Relay => self.subscribe_destination.clone(),
            ProtocolVariant::Plain => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MockConfig {
    pub enabled: bool,
    pub response_delay_ms: u64,
    pub followup_delay_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            response_delay_ms: 500,
            followup_delay_ms: 1200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UiConfig {
    pub default_mode: u8,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { default_mode: 1 }
    }
}

impl UiConfig {
    pub fn mode(&self) -> UiMode {
        UiMode::from_wire(self.default_mode as u64).unwrap_or_default()
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_config) = toml::from_str::<Config>(&raw) {
                config = file_config;
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}URL", ENV_PREFIX)) {
            self.connection.url = val;
        }
        if let Ok(val) = env::var(format!("{}RETRY_DELAY_MS", ENV_PREFIX)) {
            if let Ok(delay) = val.parse() {
                self.connection.retry_delay_ms = delay;
            }
        }

        if let Ok(val) = env::var(format!("{}VARIANT", ENV_PREFIX)) {
            match val.as_str() {
                "plain" => self.protocol.variant = ProtocolVariant::Plain,
                "relay" => self.protocol.variant = ProtocolVariant::Relay,
                other => tracing::warn!(variant = %other, "ignoring unknown protocol variant"),
            }
        }
        if let Ok(val) = env::var(format!("{}SUBSCRIBE_DESTINATION", ENV_PREFIX)) {
            self.protocol.subscribe_destination = Some(val);
        }

        if let Ok(val) = env::var(format!("{}MOCK", ENV_PREFIX)) {
            self.mock.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var(format!("{}MOCK_RESPONSE_DELAY_MS", ENV_PREFIX)) {
            if let Ok(delay) = val.parse() {
                self.mock.response_delay_ms = delay;
            }
        }
        if let Ok(val) = env::var(format!("{}MOCK_FOLLOWUP_DELAY_MS", ENV_PREFIX)) {
            if let Ok(delay) = val.parse() {
                self.mock.followup_delay_ms = delay;
            }
        }

        if let Ok(val) = env::var(format!("{}DEFAULT_MODE", ENV_PREFIX)) {
            if let Ok(mode) = val.parse() {
                self.ui.default_mode = mode;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = url::Url::parse(&self.connection.url)
            .map_err(|err| format!("connection.url is not a valid url: {err}"))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err("connection.url must use the ws or wss scheme".into());
        }
        if self.connection.retry_delay_ms < 100 {
            return Err("connection.retry_delay_ms must be >= 100".into());
        }
        if self.ui.default_mode > 1 {
            return Err("ui.default_mode must be 0 or 1".into());
        }
        if self.protocol.variant == ProtocolVariant::Relay
            && self
                .protocol
                .subscribe_destination
                .as_deref()
                .unwrap_or("")
                .trim()
                .is_empty()
        {
            return Err(
                "protocol.subscribe_destination is required when protocol.variant = \"relay\""
                    .into(),
            );
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = active_config_path();
        self.validate()?;
        let data = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".config")
        });
    base.join("kiosk-device-link").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
