use crate::{
    config::{ControlConfig, GatewayRoutes},
    gateway::{Gateway, GatewayFuture},
    session::Session,
};
use meterdeck_core::{
    wire::{
        AuditEntry, AuditLogResponse, DeviceListResponse, ExecuteRequest, ExecuteResponse,
        OutputsResponse, StatusResponse, TelemetrySample,
    },
    ControlError, Device, OutputChannel,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";

/// [`Gateway`] over HTTP. Each call runs the blocking client on tokio's blocking pool;
/// dropping the future abandons the worker's result.
pub struct HttpGateway {
    agent: ureq::Agent,
    base_url: String,
    routes: GatewayRoutes,
    session: Arc<Session>,
}

impl HttpGateway {
    pub fn new(config: &ControlConfig, session: Arc<Session>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .timeout_read(config.read_timeout())
            .build();
        Self {
            agent,
            base_url: normalize_base(&config.gateway_url),
            routes: config.routes.clone(),
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn fetch<T>(
        &self,
        method: &'static str,
        path: String,
        body: Option<String>,
    ) -> Result<T, ControlError>
    where
        T: DeserializeOwned,
    {
        let agent = self.agent.clone();
        let url = self.url(&path);
        let credential = self.session.credential();
        debug!(event = "gateway_request", method, url = %url);
        let text = tokio::task::spawn_blocking(move || {
            perform(&agent, method, &url, credential.as_deref(), body.as_deref())
        })
        .await
        .map_err(|err| ControlError::Transport(format!("request worker failed: {err}")))??;
        serde_json::from_str(&text).map_err(|err| ControlError::Format(err.to_string()))
    }
}

fn normalize_base(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn perform(
    agent: &ureq::Agent,
    method: &str,
    url: &str,
    credential: Option<&str>,
    body: Option<&str>,
) -> Result<String, ControlError> {
    let mut request = agent.request(method, url).set("Accept", JSON_CONTENT_TYPE);
    if let Some(token) = credential {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    let response = match body {
        Some(body) => request
            .set("Content-Type", JSON_CONTENT_TYPE)
            .send_string(body),
        None => request.call(),
    }
    .map_err(classify)?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(ControlError::UnexpectedStatus(status));
    }
    let content_type = response.content_type().to_ascii_lowercase();
    if content_type != JSON_CONTENT_TYPE {
        return Err(ControlError::Format(format!(
            "expected {JSON_CONTENT_TYPE}, got {content_type}"
        )));
    }
    response
        .into_string()
        .map_err(|err| ControlError::Transport(err.to_string()))
}

fn classify(err: ureq::Error) -> ControlError {
    match err {
        ureq::Error::Status(401, _) => ControlError::Unauthorized,
        ureq::Error::Status(code, _) => ControlError::UnexpectedStatus(code),
        ureq::Error::Transport(transport) => ControlError::Transport(transport.to_string()),
    }
}

impl Gateway for HttpGateway {
    fn list_devices(&self) -> GatewayFuture<'_, Vec<Device>> {
        Box::pin(async move {
            let response: DeviceListResponse =
                self.fetch("GET", self.routes.devices.clone(), None).await?;
            Ok(response.devices)
        })
    }

    fn device_status<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, StatusResponse> {
        Box::pin(async move {
            let path = GatewayRoutes::device_path(&self.routes.status, device_id);
            self.fetch("GET", path, None).await
        })
    }

    fn device_outputs<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, Vec<OutputChannel>> {
        Box::pin(async move {
            let path = GatewayRoutes::device_path(&self.routes.outputs, device_id);
            let response: OutputsResponse = self.fetch("GET", path, None).await?;
            Ok(response.outputs)
        })
    }

    fn execute(&self, request: ExecuteRequest) -> GatewayFuture<'_, ExecuteResponse> {
        Box::pin(async move {
            let body = serde_json::to_string(&request)
                .map_err(|err| ControlError::InvalidRequest(err.to_string()))?;
            self.fetch("POST", self.routes.execute.clone(), Some(body))
                .await
        })
    }

    fn audit_log(&self) -> GatewayFuture<'_, Vec<AuditEntry>> {
        Box::pin(async move {
            let response: AuditLogResponse =
                self.fetch("GET", self.routes.audit_log.clone(), None).await?;
            Ok(response.into_entries())
        })
    }

    fn telemetry<'a>(&'a self, device_id: &'a str) -> GatewayFuture<'a, TelemetrySample> {
        Box::pin(async move {
            let path = GatewayRoutes::device_path(&self.routes.telemetry, device_id);
            self.fetch("GET", path, None).await
        })
    }
}
