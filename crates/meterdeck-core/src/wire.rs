use crate::{
    deserialize_id, ControlAction, ControlError, Device, DeviceStatus, OutputChannel,
    StatusRecord, StatusTag,
};
use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const DEFAULT_CONTROL_MODE: &str = "remote";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceListResponse {
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEntry {
    #[serde(deserialize_with = "deserialize_id")]
    pub key: String,
    pub status: String,
    #[serde(deserialize_with = "deserialize_reading")]
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

impl StatusResponse {
    /// Narrows the entries into confirmed records. A blank key or a duplicated key
    /// rejects the whole payload.
    pub fn into_records(self) -> Result<DeviceStatus, ControlError> {
        let mut records = DeviceStatus::new();
        for entry in self.statuses {
            let key = entry.key.trim();
            if key.is_empty() {
                return Err(ControlError::Format("status entry with empty key".to_string()));
            }
            if !entry.value.is_finite() {
                return Err(ControlError::Format(format!(
                    "status entry {key} has non-finite value"
                )));
            }
            let record = StatusRecord::confirmed(StatusTag::from(entry.status), entry.value);
            if records.insert(key.to_string(), record).is_some() {
                return Err(ControlError::Format(format!("duplicate status key {key}")));
            }
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputsResponse {
    #[serde(default)]
    pub outputs: Vec<OutputChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteRequest {
    pub device_id: String,
    pub control_mode: String,
    pub control_target: String,
    pub action: ControlAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub operator: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResponse {
    pub status: ExecuteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecuteResponse {
    pub fn success() -> Self {
        Self {
            status: ExecuteStatus::Success,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecuteStatus::Error,
            error_message: Some(message.into()),
        }
    }

    /// Turns a logical failure into [`ControlError::Rejected`].
    pub fn into_result(self) -> Result<(), ControlError> {
        match self.status {
            ExecuteStatus::Success => Ok(()),
            ExecuteStatus::Error => Err(ControlError::Rejected(
                self.error_message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "gateway reported an error".to_string()),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    #[serde(deserialize_with = "deserialize_id")]
    pub device_id: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub executed_at: String,
}

impl AuditEntry {
    pub fn executed_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.executed_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AuditLogResponse {
    Entries(Vec<AuditEntry>),
    Wrapped {
        #[serde(default)]
        logs: Vec<AuditEntry>,
    },
}

impl AuditLogResponse {
    pub fn into_entries(self) -> Vec<AuditEntry> {
        match self {
            AuditLogResponse::Entries(entries) => entries,
            AuditLogResponse::Wrapped { logs } => logs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TelemetrySample {
    #[serde(default)]
    pub device_id: Option<String>,
    /// Average phase current in amperes.
    #[serde(default, deserialize_with = "deserialize_optional_reading")]
    pub current_avg: Option<f64>,
    /// Total active power in kilowatts.
    #[serde(default, deserialize_with = "deserialize_optional_reading")]
    pub power_total: Option<f64>,
    #[serde(default)]
    pub sampled_at: Option<String>,
}

struct ReadingVisitor;

impl<'de> Visitor<'de> for ReadingVisitor {
    type Value = f64;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a numeric reading as number, numeric string or boolean")
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value)
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value as f64)
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value as f64)
    }

    fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(if value { 1.0 } else { 0.0 })
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        value
            .trim()
            .parse::<f64>()
            .map_err(|err| E::custom(format!("invalid reading '{value}': {err}")))
    }
}

fn deserialize_reading<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(ReadingVisitor)
}

fn deserialize_optional_reading<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .deserialize_any(ReadingVisitor)
            .map(Some)
            .map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_payload_narrows_mixed_value_shapes() {
        let response: StatusResponse = serde_json::from_value(json!({
            "statuses": [
                {"key": "relay-1", "status": "ON", "value": 1},
                {"key": 2, "status": "off", "value": "0.0"},
                {"key": "relay-3", "status": "FAULT", "value": 3.5}
            ]
        }))
        .expect("decode");

        let records = response.into_records().expect("narrow");
        assert_eq!(records.len(), 3);
        assert_eq!(records["relay-1"].status, StatusTag::On);
        assert_eq!(records["2"].status, StatusTag::Off);
        assert_eq!(records["2"].value, 0.0);
        assert!(!records["relay-3"].is_pending());
    }

    #[test]
    fn status_payload_with_garbage_value_is_rejected() {
        let result = serde_json::from_value::<StatusResponse>(json!({
            "statuses": [{"key": "relay-1", "status": "ON", "value": "unknown"}]
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<StatusResponse>(json!({
            "statuses": [{"key": "relay-1", "status": "ON", "value": null}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn status_payload_with_blank_or_duplicate_key_is_rejected() {
        let blank = StatusResponse {
            statuses: vec![StatusEntry {
                key: " ".to_string(),
                status: "ON".to_string(),
                value: 1.0,
            }],
        };
        assert!(matches!(blank.into_records(), Err(ControlError::Format(_))));

        let entry = StatusEntry {
            key: "relay-1".to_string(),
            status: "ON".to_string(),
            value: 1.0,
        };
        let duplicated = StatusResponse {
            statuses: vec![entry.clone(), entry],
        };
        assert!(matches!(
            duplicated.into_records(),
            Err(ControlError::Format(_))
        ));
    }

    #[test]
    fn execute_response_error_becomes_rejection_with_server_message() {
        let response: ExecuteResponse = serde_json::from_value(json!({
            "status": "error",
            "error_message": "device offline"
        }))
        .expect("decode");
        assert_eq!(
            response.into_result(),
            Err(ControlError::Rejected("device offline".to_string()))
        );

        let response: ExecuteResponse =
            serde_json::from_value(json!({"status": "success"})).expect("decode");
        assert_eq!(response.into_result(), Ok(()));

        assert!(serde_json::from_value::<ExecuteResponse>(json!({"status": "maybe"})).is_err());
    }

    #[test]
    fn audit_log_accepts_bare_and_wrapped_lists() {
        let entry = json!({
            "device_id": "meter-7",
            "operator": "ops",
            "action": "trip",
            "status": "success",
            "executed_at": "2026-03-01T10:00:00Z"
        });
        let bare: AuditLogResponse = serde_json::from_value(json!([entry.clone()])).expect("bare");
        let wrapped: AuditLogResponse =
            serde_json::from_value(json!({"logs": [entry]})).expect("wrapped");
        let bare = bare.into_entries();
        assert_eq!(bare, wrapped.into_entries());
        assert!(bare[0].executed_at_utc().is_some());
    }

    #[test]
    fn telemetry_sample_tolerates_missing_and_string_readings() {
        let sample: TelemetrySample = serde_json::from_value(json!({
            "current_avg": "2.5",
            "power_total": null
        }))
        .expect("decode");
        assert_eq!(sample.current_avg, Some(2.5));
        assert_eq!(sample.power_total, None);

        let sample: TelemetrySample = serde_json::from_value(json!({})).expect("empty");
        assert_eq!(sample, TelemetrySample::default());
    }

    #[test]
    fn execute_request_uses_wire_field_names() {
        let request = ExecuteRequest {
            device_id: "meter-7".to_string(),
            control_mode: DEFAULT_CONTROL_MODE.to_string(),
            control_target: "Q1".to_string(),
            action: ControlAction::Trip,
            reason: "maintenance".to_string(),
            operator: "ops".to_string(),
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["action"], "trip");
        assert_eq!(value["control_target"], "Q1");
        assert_eq!(value["control_mode"], "remote");
    }
}
