use futures_util::future::BoxFuture;
use meterdeck_core::{
    wire::{AuditEntry, ExecuteRequest, ExecuteResponse, StatusResponse, TelemetrySample},
    ControlError, Device, OutputChannel,
};

pub type GatewayFuture<'a, T> = BoxFuture<'a, Result<T, ControlError>>;

/// The remote control gateway plus the telemetry service behind it.
///
/// Implementations narrow every response into typed payloads and classify failures
/// into [`ControlError`]; a `401` must surface as [`ControlError::Unauthorized`].
pub trait Gateway: Send + Sync {
    fn list_devices(&self) -> GatewayFuture<'_, Vec<Device>>;

    fn device_status<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, StatusResponse>;

    fn device_outputs<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, Vec<OutputChannel>>;

    fn execute(&self, request: ExecuteRequest) -> GatewayFuture<'_, ExecuteResponse>;

    fn audit_log(&self) -> GatewayFuture<'_, Vec<AuditEntry>>;

    fn telemetry<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, TelemetrySample>;
}
