//! In-memory control gateway: serves the device, status, command and telemetry endpoints
//! with one simulated relay per output.

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use meterdeck_core::{
    wire::{
        AuditEntry, DeviceListResponse, ExecuteRequest, ExecuteResponse, OutputsResponse,
        StatusEntry, StatusResponse, TelemetrySample,
    },
    Device, OutputChannel,
};
use serde_json::json;
use std::{
    collections::HashMap,
    fs,
    path::{Path as FsPath, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Single-phase line voltage used to derive power from current.
const LINE_KILOVOLTS: f64 = 0.23;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("device file read failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("device file parse failed: {0}")]
    Parse(String),
    #[error("device file has no devices")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Required bearer credential; `None` accepts every request.
    pub token: Option<String>,
    pub actuation_delay: Duration,
    pub load_current_amps: f64,
    pub leakage_amps: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            token: None,
            actuation_delay: Duration::from_millis(2_000),
            load_current_amps: 4.2,
            leakage_amps: 0.05,
        }
    }
}

pub struct SimState {
    config: SimConfig,
    devices: Vec<Device>,
    outputs: HashMap<String, Vec<OutputChannel>>,
    relays: Mutex<HashMap<(String, String), bool>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl SimState {
    /// Every device gets its outputs (or a single `relay-1`) with each relay closed.
    pub fn new(config: SimConfig, devices: Vec<Device>) -> Self {
        let mut outputs = HashMap::new();
        let mut relays = HashMap::new();
        for device in &devices {
            let channels = device
                .outputs
                .clone()
                .filter(|list| !list.is_empty())
                .unwrap_or_else(|| vec![relay("relay-1", 1)]);
            for channel in &channels {
                relays.insert((device.device_id.clone(), channel.key.clone()), true);
            }
            outputs.insert(device.device_id.clone(), channels);
        }
        Self {
            config,
            devices,
            outputs,
            relays: Mutex::new(relays),
            audit: Mutex::new(Vec::new()),
        }
    }

    pub fn demo(config: SimConfig) -> Self {
        Self::new(config, demo_devices())
    }

    pub fn relay_closed(&self, device_id: &str, key: &str) -> Option<bool> {
        self.lock_relays()
            .get(&(device_id.to_string(), key.to_string()))
            .copied()
    }

    pub fn audit_len(&self) -> usize {
        self.lock_audit().len()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = self.config.token.as_deref() else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|presented| presented == token)
    }

    fn channels(&self, device_id: &str) -> Option<&Vec<OutputChannel>> {
        self.outputs.get(device_id)
    }

    fn set_relay(&self, device_id: &str, key: &str, closed: bool) {
        self.lock_relays()
            .insert((device_id.to_string(), key.to_string()), closed);
    }

    fn lock_relays(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), bool>> {
        self.relays.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_audit(&self) -> std::sync::MutexGuard<'_, Vec<AuditEntry>> {
        self.audit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn router(state: Arc<SimState>) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/status", get(device_status))
        .route("/api/devices/:id/outputs", get(device_outputs))
        .route("/api/devices/:id/telemetry", get(device_telemetry))
        .route("/api/control/execute", post(execute))
        .route("/api/control/audit_log", get(audit_log))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

fn unknown_device(device_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "unknown_device", "device_id": device_id })),
    )
        .into_response()
}

async fn list_devices(State(sim): State<Arc<SimState>>, headers: HeaderMap) -> Response {
    if !sim.authorized(&headers) {
        return unauthorized();
    }
    Json(DeviceListResponse {
        devices: sim.devices.clone(),
    })
    .into_response()
}

async fn device_status(
    State(sim): State<Arc<SimState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if !sim.authorized(&headers) {
        return unauthorized();
    }
    let Some(channels) = sim.channels(&device_id) else {
        return unknown_device(&device_id);
    };
    let relays = sim.lock_relays();
    let statuses = channels
        .iter()
        .map(|channel| {
            let closed = relays
                .get(&(device_id.clone(), channel.key.clone()))
                .copied()
                .unwrap_or(false);
            StatusEntry {
                key: channel.key.clone(),
                status: if closed { "ON" } else { "OFF" }.to_string(),
                value: if closed { 1.0 } else { 0.0 },
            }
        })
        .collect();
    Json(StatusResponse { statuses }).into_response()
}

async fn device_outputs(
    State(sim): State<Arc<SimState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if !sim.authorized(&headers) {
        return unauthorized();
    }
    match sim.channels(&device_id) {
        Some(outputs) => Json(OutputsResponse {
            outputs: outputs.clone(),
        })
        .into_response(),
        None => unknown_device(&device_id),
    }
}

async fn device_telemetry(
    State(sim): State<Arc<SimState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if !sim.authorized(&headers) {
        return unauthorized();
    }
    let Some(channels) = sim.channels(&device_id) else {
        return unknown_device(&device_id);
    };
    let closed = {
        let relays = sim.lock_relays();
        channels
            .iter()
            .filter(|channel| {
                relays
                    .get(&(device_id.clone(), channel.key.clone()))
                    .copied()
                    .unwrap_or(false)
            })
            .count()
    };
    let amps = if closed == 0 {
        sim.config.leakage_amps
    } else {
        sim.config.load_current_amps * closed as f64
    };
    Json(TelemetrySample {
        device_id: Some(device_id),
        current_avg: Some(amps),
        power_total: Some(amps * LINE_KILOVOLTS),
        sampled_at: Some(Utc::now().to_rfc3339()),
    })
    .into_response()
}

async fn execute(
    State(sim): State<Arc<SimState>>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    if !sim.authorized(&headers) {
        return unauthorized();
    }
    let Some(channels) = sim.channels(&request.device_id) else {
        warn!(event = "sim_execute_rejected", device_id = %request.device_id, reason = "unknown_device");
        return Json(ExecuteResponse::error(format!(
            "unknown device {}",
            request.device_id
        )))
        .into_response();
    };
    let Some(channel) = channels.iter().find(|channel| {
        channel.control_target == request.control_target || channel.key == request.control_target
    }) else {
        warn!(
            event = "sim_execute_rejected",
            device_id = %request.device_id,
            target = %request.control_target,
            reason = "unknown_target"
        );
        return Json(ExecuteResponse::error(format!(
            "unknown control target {}",
            request.control_target
        )))
        .into_response();
    };

    let closed = request.action.energizes();
    let key = channel.key.clone();
    sim.lock_audit().push(AuditEntry {
        device_id: request.device_id.clone(),
        operator: request.operator.clone(),
        action: request.action.to_string(),
        status: "success".to_string(),
        executed_at: Utc::now().to_rfc3339(),
    });
    info!(
        event = "sim_execute",
        device_id = %request.device_id,
        key = %key,
        action = %request.action,
        operator = %request.operator
    );

    let delay = sim.config.actuation_delay;
    let device_id = request.device_id;
    let actuator = sim.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        actuator.set_relay(&device_id, &key, closed);
        debug!(event = "sim_relay_moved", device_id = %device_id, key = %key, closed);
    });
    Json(ExecuteResponse::success()).into_response()
}

async fn audit_log(State(sim): State<Arc<SimState>>, headers: HeaderMap) -> Response {
    if !sim.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "logs": sim.lock_audit().clone() })).into_response()
}

fn relay(key: &str, index: usize) -> OutputChannel {
    OutputChannel {
        key: key.to_string(),
        address: format!("coil/{index}"),
        description: format!("Relay {index}"),
        control_target: key.to_string(),
    }
}

pub fn demo_devices() -> Vec<Device> {
    let meter = |id: &str, name: &str, outputs: Option<Vec<OutputChannel>>| Device {
        device_id: id.to_string(),
        device_name: name.to_string(),
        project: "north-feeder".to_string(),
        manufacturer: Some("Acme Metering".to_string()),
        model: Some("AM-3".to_string()),
        converter: Some("gw-1".to_string()),
        outputs,
    };
    vec![
        meter(
            "MTR-001",
            "Main incomer",
            Some(vec![relay("relay-1", 1), relay("relay-2", 2)]),
        ),
        meter("MTR-002", "Pump house", None),
        meter("MTR-003", "Workshop", None),
    ]
}

/// Loads devices from a JSON or TOML file shaped like the device list response.
pub fn load_devices(path: &FsPath) -> Result<Vec<Device>, SimError> {
    let contents = fs::read_to_string(path).map_err(|source| SimError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: DeviceListResponse = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&contents).map_err(|err| SimError::Parse(err.to_string()))?,
        _ => serde_json::from_str(&contents).map_err(|err| SimError::Parse(err.to_string()))?,
    };
    if parsed.devices.is_empty() {
        return Err(SimError::Empty);
    }
    Ok(parsed.devices)
}
