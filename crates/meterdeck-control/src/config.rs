use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const CONFIG_ENV: &str = "METERDECK_CONFIG";
pub const GATEWAY_URL_ENV: &str = "METERDECK_GATEWAY_URL";
pub const TOKEN_ENV: &str = "METERDECK_TOKEN";
pub const OPERATOR_ENV: &str = "METERDECK_OPERATOR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub gateway_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub operator: String,
    pub status_poll_ms: u64,
    pub audit_refresh_ms: u64,
    pub debounce_ms: u64,
    pub reconcile_offsets_ms: Vec<u64>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub routes: GatewayRoutes,
    pub verification: VerificationConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8090/api/".to_string(),
            credential: None,
            operator: "operator".to_string(),
            status_poll_ms: 2_000,
            audit_refresh_ms: 5_000,
            debounce_ms: 300,
            reconcile_offsets_ms: vec![500, 1_500, 3_000],
            connect_timeout_ms: 1_500,
            read_timeout_ms: 5_000,
            routes: GatewayRoutes::default(),
            verification: VerificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayRoutes {
    pub devices: String,
    pub status: String,
    pub outputs: String,
    pub telemetry: String,
    pub execute: String,
    pub audit_log: String,
}

impl Default for GatewayRoutes {
    fn default() -> Self {
        Self {
            devices: "devices".to_string(),
            status: "devices/{id}/status".to_string(),
            outputs: "devices/{id}/outputs".to_string(),
            telemetry: "devices/{id}/telemetry".to_string(),
            execute: "control/execute".to_string(),
            audit_log: "control/audit_log".to_string(),
        }
    }
}

impl GatewayRoutes {
    /// Expands `{id}` with the percent-encoded device id.
    pub fn device_path(template: &str, device_id: &str) -> String {
        template.replace("{id}", &urlencoding::encode(device_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerificationConfig {
    pub tick_ms: u64,
    pub timeout_ms: u64,
    pub off_current_amps: f64,
    pub off_power_kw: f64,
    pub on_current_amps: f64,
    pub on_power_kw: f64,
    pub baseline_multiplier: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            timeout_ms: 10_000,
            off_current_amps: 0.2,
            off_power_kw: 0.05,
            on_current_amps: 0.5,
            on_power_kw: 0.1,
            baseline_multiplier: 1.5,
        }
    }
}

impl VerificationConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ControlConfig {
    /// Loads the TOML file, applies environment overrides and validates. An explicit path
    /// must exist; the default location may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match std::env::var(CONFIG_ENV) {
                Ok(value) if !value.trim().is_empty() => (PathBuf::from(value), true),
                _ => (default_config_path(), false),
            },
        };
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound && !required => Self::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value_of = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = value_of(GATEWAY_URL_ENV) {
            self.gateway_url = url;
        }
        if let Some(token) = value_of(TOKEN_ENV) {
            self.credential = Some(token);
        }
        if let Some(operator) = value_of(OPERATOR_ENV) {
            self.operator = operator;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.gateway_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "gateway_url must be http(s): {url}"
            )));
        }
        for (name, value) in [
            ("status_poll_ms", self.status_poll_ms),
            ("audit_refresh_ms", self.audit_refresh_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("verification.tick_ms", self.verification.tick_ms),
            ("verification.timeout_ms", self.verification.timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.reconcile_offsets_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "reconcile_offsets_ms needs at least one offset".to_string(),
            ));
        }
        if self
            .reconcile_offsets_ms
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(ConfigError::Invalid(
                "reconcile_offsets_ms must be ascending".to_string(),
            ));
        }
        let verification = &self.verification;
        if verification.timeout_ms < verification.tick_ms {
            return Err(ConfigError::Invalid(
                "verification.timeout_ms must cover at least one tick".to_string(),
            ));
        }
        for (name, value) in [
            ("off_current_amps", verification.off_current_amps),
            ("off_power_kw", verification.off_power_kw),
            ("on_current_amps", verification.on_current_amps),
            ("on_power_kw", verification.on_power_kw),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "verification.{name} must be a non-negative number"
                )));
            }
        }
        if !verification.baseline_multiplier.is_finite() || verification.baseline_multiplier < 1.0
        {
            return Err(ConfigError::Invalid(
                "verification.baseline_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn audit_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.audit_refresh_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reconcile_offsets(&self) -> Vec<Duration> {
        self.reconcile_offsets_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(value) = std::env::var("XDG_CONFIG_HOME") {
        if !value.trim().is_empty() {
            return PathBuf::from(value).join("meterdeck").join("config.toml");
        }
    }
    if let Ok(value) = std::env::var("HOME") {
        return PathBuf::from(value)
            .join(".config")
            .join("meterdeck")
            .join("config.toml");
    }
    PathBuf::from(".meterdeck/config.toml")
}
