use crate::{gateway::Gateway, session::Session};
use meterdeck_core::{ControlError, Device, OutputChannel};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{info, warn};

/// Device list and per-device output descriptors, cached for the session.
pub struct DeviceRegistry {
    gateway: Arc<dyn Gateway>,
    session: Arc<Session>,
    devices: Mutex<Option<Arc<Vec<Device>>>>,
    outputs: Mutex<HashMap<String, Vec<OutputChannel>>>,
    loading: tokio::sync::Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(gateway: Arc<dyn Gateway>, session: Arc<Session>) -> Self {
        Self {
            gateway,
            session,
            devices: Mutex::new(None),
            outputs: Mutex::new(HashMap::new()),
            loading: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the cached list unless `force` is set. Concurrent first loads share one
    /// gateway call.
    pub async fn load_devices(&self, force: bool) -> Result<Arc<Vec<Device>>, ControlError> {
        if !force {
            if let Some(devices) = self.cached_devices() {
                return Ok(devices);
            }
        }
        let _loading = self.loading.lock().await;
        if !force {
            if let Some(devices) = self.cached_devices() {
                return Ok(devices);
            }
        }

        let devices = match self.session.screen(self.gateway.list_devices().await) {
            Ok(devices) => devices,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(event = "devices_load_failed", code = err.code(), error = %err);
                }
                return Err(err);
            }
        };

        {
            let mut outputs = self.lock_outputs();
            for device in &devices {
                if let Some(channels) = device.outputs.as_ref().filter(|list| !list.is_empty()) {
                    outputs.insert(device.device_id.clone(), channels.clone());
                }
            }
        }
        let devices = Arc::new(devices);
        *self.lock_devices() = Some(devices.clone());
        info!(event = "devices_loaded", count = devices.len(), forced = force);
        Ok(devices)
    }

    pub fn cached_devices(&self) -> Option<Arc<Vec<Device>>> {
        self.lock_devices().clone()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.lock_devices()
            .as_ref()
            .and_then(|devices| devices.iter().find(|d| d.device_id == device_id).cloned())
    }

    pub fn cached_outputs(&self, device_id: &str) -> Option<Vec<OutputChannel>> {
        self.lock_outputs().get(device_id).cloned()
    }

    pub fn store_outputs(&self, device_id: &str, outputs: Vec<OutputChannel>) {
        self.lock_outputs().insert(device_id.to_string(), outputs);
    }

    /// Finds an output by key, falling back to a match on address.
    pub fn resolve_output(&self, device_id: &str, key_or_address: &str) -> Option<OutputChannel> {
        let outputs = self.lock_outputs();
        let channels = outputs.get(device_id)?;
        channels
            .iter()
            .find(|channel| channel.key == key_or_address)
            .or_else(|| channels.iter().find(|channel| channel.address == key_or_address))
            .cloned()
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, Option<Arc<Vec<Device>>>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_outputs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<OutputChannel>>> {
        self.outputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
