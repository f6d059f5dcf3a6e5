use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod error;
pub mod wire;

pub use error::ControlError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(deserialize_with = "deserialize_id")]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Logical group (converter / hub) the device is wired behind.
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default)]
    pub outputs: Option<Vec<OutputChannel>>,
}

impl Device {
    pub fn label(&self) -> &str {
        if self.device_name.trim().is_empty() {
            &self.device_id
        } else {
            &self.device_name
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputChannel {
    #[serde(deserialize_with = "deserialize_id")]
    pub key: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub control_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusTag {
    On,
    Off,
    Other(String),
}

impl StatusTag {
    pub fn as_str(&self) -> &str {
        match self {
            StatusTag::On => "ON",
            StatusTag::Off => "OFF",
            StatusTag::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for StatusTag {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" | "TRUE" | "CLOSED" => StatusTag::On,
            "OFF" | "0" | "FALSE" | "OPEN" | "TRIPPED" => StatusTag::Off,
            _ => StatusTag::Other(raw),
        }
    }
}

impl From<StatusTag> for String {
    fn from(tag: StatusTag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Energize the output.
    #[serde(alias = "on")]
    Close,
    /// De-energize the output.
    #[serde(alias = "off")]
    Trip,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Close => "close",
            ControlAction::Trip => "trip",
        }
    }

    pub fn energizes(&self) -> bool {
        matches!(self, ControlAction::Close)
    }

    pub fn expected_status(&self) -> StatusTag {
        match self {
            ControlAction::Close => StatusTag::On,
            ControlAction::Trip => StatusTag::Off,
        }
    }

    pub fn expected_value(&self) -> f64 {
        match self {
            ControlAction::Close => 1.0,
            ControlAction::Trip => 0.0,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "close" | "on" | "energize" => Ok(ControlAction::Close),
            "trip" | "off" | "open" | "de-energize" | "deenergize" => Ok(ControlAction::Trip),
            other => Err(format!("Unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: StatusTag,
    pub value: f64,
    /// Set while the record holds an optimistic value awaiting confirmation.
    #[serde(default)]
    pub pending_since: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn confirmed(status: StatusTag, value: f64) -> Self {
        Self {
            status,
            value,
            pending_since: None,
        }
    }

    pub fn optimistic(action: ControlAction, since: DateTime<Utc>) -> Self {
        Self {
            status: action.expected_status(),
            value: action.expected_value(),
            pending_since: Some(since),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }
}

pub type DeviceStatus = BTreeMap<String, StatusRecord>;

pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
