#![allow(dead_code)]

use meterdeck_control::{
    gateway::{Gateway, GatewayFuture},
    wire::{AuditEntry, ExecuteRequest, ExecuteResponse, StatusEntry, StatusResponse, TelemetrySample},
    ControlAction, ControlError, Device, OutputChannel,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::{self, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Status,
    Outputs,
    Execute,
    Audit,
    Telemetry,
}

#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    Success,
    Error(String),
    Unauthorized,
    Transport,
}

/// Time since the last acknowledged command, `None` before any command.
pub type TelemetryFn =
    Box<dyn Fn(Option<Duration>) -> Result<TelemetrySample, ControlError> + Send + Sync>;

struct State {
    devices: Vec<Device>,
    truth: HashMap<String, Vec<StatusEntry>>,
    outputs: HashMap<String, Vec<OutputChannel>>,
    list_latency: Duration,
    status_latency: Duration,
    status_delays: VecDeque<Duration>,
    outputs_latency: Duration,
    execute_outcome: ExecuteOutcome,
    flip_on_execute: bool,
    unauthorized: bool,
    telemetry: Option<TelemetryFn>,
    telemetry_latency: Duration,
    telemetry_delays: VecDeque<Duration>,
    audit: Vec<AuditEntry>,
    calls: Vec<(Op, String)>,
    executed: Vec<ExecuteRequest>,
    last_execute: Option<Instant>,
}

/// Scripted in-memory gateway. Status responses snapshot server truth when the request
/// arrives and answer after the configured latency.
pub struct FakeGateway {
    state: Mutex<State>,
    live_status: AtomicUsize,
    peak_status: AtomicUsize,
}

struct LiveStatus<'a>(&'a AtomicUsize);

impl Drop for LiveStatus<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                devices: Vec::new(),
                truth: HashMap::new(),
                outputs: HashMap::new(),
                list_latency: Duration::ZERO,
                status_latency: Duration::ZERO,
                status_delays: VecDeque::new(),
                outputs_latency: Duration::ZERO,
                execute_outcome: ExecuteOutcome::Success,
                flip_on_execute: false,
                unauthorized: false,
                telemetry: None,
                telemetry_latency: Duration::ZERO,
                telemetry_delays: VecDeque::new(),
                audit: Vec::new(),
                calls: Vec::new(),
                executed: Vec::new(),
                last_execute: None,
            }),
            live_status: AtomicUsize::new(0),
            peak_status: AtomicUsize::new(0),
        }
    }

    /// Gateway with meters `meter-a`, `meter-b`, `meter-c`, each with relay `relay-1` ON.
    pub fn with_meters() -> Arc<Self> {
        let gateway = Self::new();
        for id in ["meter-a", "meter-b", "meter-c"] {
            gateway.add_device(device(id, None), vec![relay("relay-1")]);
            gateway.set_truth(id, "relay-1", "ON", 1.0);
        }
        Arc::new(gateway)
    }

    pub fn add_device(&self, device: Device, outputs: Vec<OutputChannel>) {
        let mut state = self.lock();
        state.outputs.insert(device.device_id.clone(), outputs);
        state.devices.push(device);
    }

    pub fn set_truth(&self, device_id: &str, key: &str, status: &str, value: f64) {
        let mut state = self.lock();
        let entries = state.truth.entry(device_id.to_string()).or_default();
        entries.retain(|entry| entry.key != key);
        entries.push(StatusEntry {
            key: key.to_string(),
            status: status.to_string(),
            value,
        });
    }

    pub fn set_list_latency(&self, latency: Duration) {
        self.lock().list_latency = latency;
    }

    pub fn set_status_latency(&self, latency: Duration) {
        self.lock().status_latency = latency;
    }

    /// Latencies for the next status requests, in order; afterwards the default applies.
    pub fn script_status_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.lock().status_delays.extend(delays);
    }

    pub fn set_outputs_latency(&self, latency: Duration) {
        self.lock().outputs_latency = latency;
    }

    pub fn set_execute_outcome(&self, outcome: ExecuteOutcome) {
        self.lock().execute_outcome = outcome;
    }

    /// Successful commands move server truth to the commanded state.
    pub fn flip_on_execute(&self, enabled: bool) {
        self.lock().flip_on_execute = enabled;
    }

    pub fn reject_credentials(&self, enabled: bool) {
        self.lock().unauthorized = enabled;
    }

    pub fn set_telemetry(&self, telemetry: TelemetryFn) {
        self.lock().telemetry = Some(telemetry);
    }

    pub fn set_telemetry_latency(&self, latency: Duration) {
        self.lock().telemetry_latency = latency;
    }

    /// Latencies for the next telemetry requests, in order; afterwards the default applies.
    pub fn script_telemetry_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.lock().telemetry_delays.extend(delays);
    }

    pub fn calls(&self, op: Op, scope: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(call, id)| *call == op && id == scope)
            .count()
    }

    pub fn total_calls(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|(call, _)| *call == op).count()
    }

    pub fn executed(&self) -> Vec<ExecuteRequest> {
        self.lock().executed.clone()
    }

    pub fn peak_concurrent_status(&self) -> usize {
        self.peak_status.load(Ordering::SeqCst)
    }

    fn record(&self, op: Op, scope: &str) -> Result<(), ControlError> {
        let mut state = self.lock();
        state.calls.push((op, scope.to_string()));
        if state.unauthorized {
            return Err(ControlError::Unauthorized);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake gateway state")
    }
}

impl Gateway for FakeGateway {
    fn list_devices(&self) -> GatewayFuture<'_, Vec<Device>> {
        Box::pin(async move {
            let latency = self.lock().list_latency;
            time::sleep(latency).await;
            self.record(Op::List, "")?;
            Ok(self.lock().devices.clone())
        })
    }

    fn device_status<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, StatusResponse> {
        Box::pin(async move {
            let live = self.live_status.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_status.fetch_max(live, Ordering::SeqCst);
            let _live = LiveStatus(&self.live_status);

            self.record(Op::Status, device_id)?;
            let (statuses, latency) = {
                let mut state = self.lock();
                let latency = state
                    .status_delays
                    .pop_front()
                    .unwrap_or(state.status_latency);
                (state.truth.get(device_id).cloned().unwrap_or_default(), latency)
            };
            time::sleep(latency).await;
            Ok(StatusResponse { statuses })
        })
    }

    fn device_outputs<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, Vec<OutputChannel>> {
        Box::pin(async move {
            self.record(Op::Outputs, device_id)?;
            let (outputs, latency) = {
                let state = self.lock();
                (
                    state.outputs.get(device_id).cloned().unwrap_or_default(),
                    state.outputs_latency,
                )
            };
            time::sleep(latency).await;
            Ok(outputs)
        })
    }

    fn execute(&self, request: ExecuteRequest) -> GatewayFuture<'_, ExecuteResponse> {
        Box::pin(async move {
            self.record(Op::Execute, &request.device_id)?;
            let mut state = self.lock();
            state.executed.push(request.clone());
            match state.execute_outcome.clone() {
                ExecuteOutcome::Success => {}
                ExecuteOutcome::Error(message) => return Ok(ExecuteResponse::error(message)),
                ExecuteOutcome::Unauthorized => return Err(ControlError::Unauthorized),
                ExecuteOutcome::Transport => {
                    return Err(ControlError::Transport("connection reset".to_string()))
                }
            }
            state.last_execute = Some(Instant::now());
            state.audit.push(AuditEntry {
                device_id: request.device_id.clone(),
                operator: request.operator.clone(),
                action: request.action.to_string(),
                status: "success".to_string(),
                executed_at: "2026-10-19T08:00:00Z".to_string(),
            });
            if state.flip_on_execute {
                let (status, value) = match request.action {
                    ControlAction::Close => ("ON", 1.0),
                    ControlAction::Trip => ("OFF", 0.0),
                };
                let entries = state.truth.entry(request.device_id.clone()).or_default();
                for entry in entries.iter_mut() {
                    if entry.key == request.control_target {
                        entry.status = status.to_string();
                        entry.value = value;
                    }
                }
            }
            Ok(ExecuteResponse::success())
        })
    }

    fn audit_log(&self) -> GatewayFuture<'_, Vec<AuditEntry>> {
        Box::pin(async move {
            self.record(Op::Audit, "")?;
            Ok(self.lock().audit.clone())
        })
    }

    fn telemetry<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, TelemetrySample> {
        Box::pin(async move {
            self.record(Op::Telemetry, device_id)?;
            let latency = {
                let mut state = self.lock();
                state
                    .telemetry_delays
                    .pop_front()
                    .unwrap_or(state.telemetry_latency)
            };
            time::sleep(latency).await;
            let state = self.lock();
            let since = state.last_execute.map(|at| Instant::now() - at);
            match state.telemetry.as_ref() {
                Some(telemetry) => telemetry(since),
                None => Ok(TelemetrySample::default()),
            }
        })
    }
}

pub fn device(id: &str, outputs: Option<Vec<OutputChannel>>) -> Device {
    Device {
        device_id: id.to_string(),
        device_name: format!("Meter {id}"),
        project: "north-feeder".to_string(),
        manufacturer: None,
        model: None,
        converter: None,
        outputs,
    }
}

pub fn relay(key: &str) -> OutputChannel {
    OutputChannel {
        key: key.to_string(),
        address: format!("coil/{key}"),
        description: format!("Relay {key}"),
        control_target: key.to_string(),
    }
}

pub fn current(amps: f64) -> TelemetrySample {
    TelemetrySample {
        current_avg: Some(amps),
        ..TelemetrySample::default()
    }
}
