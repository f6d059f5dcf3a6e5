use crate::{
    inflight::{InflightTable, RequestClass},
    poller::{ForegroundPolling, StatusPoller},
    scheduler::{Scheduler, TimerName},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// Collapses bursts of selection changes into one fetch for the final device.
pub struct SelectionDebouncer {
    poller: Arc<StatusPoller>,
    foreground: Arc<ForegroundPolling>,
    inflight: Arc<InflightTable>,
    scheduler: Arc<Scheduler>,
    quiet: Duration,
    selected: Mutex<Option<String>>,
}

impl SelectionDebouncer {
    pub fn new(
        poller: Arc<StatusPoller>,
        foreground: Arc<ForegroundPolling>,
        inflight: Arc<InflightTable>,
        scheduler: Arc<Scheduler>,
        quiet: Duration,
    ) -> Self {
        Self {
            poller,
            foreground,
            inflight,
            scheduler,
            quiet,
            selected: Mutex::new(None),
        }
    }

    pub fn select(&self, device_id: &str) {
        let previous = self.lock().replace(device_id.to_string());
        if let Some(previous) = previous.filter(|previous| previous != device_id) {
            self.inflight.cancel(&previous, RequestClass::Status);
            self.inflight.cancel(&previous, RequestClass::Outputs);
            self.foreground.stop();
            debug!(event = "selection_changed", from = %previous, to = device_id);
        }

        let poller = self.poller.clone();
        let foreground = self.foreground.clone();
        let device_id = device_id.to_string();
        self.scheduler.after(TimerName::Selection, self.quiet, async move {
            let _ = poller.fetch_outputs(&device_id).await;
            let _ = poller.fetch_status(&device_id).await;
            foreground.focus(&device_id);
        });
    }

    pub fn selected(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Drops the selection and any pending quiet-window timer.
    pub fn clear(&self) {
        if let Some(previous) = self.lock().take() {
            self.inflight.cancel(&previous, RequestClass::Status);
            self.inflight.cancel(&previous, RequestClass::Outputs);
        }
        self.scheduler.cancel(&TimerName::Selection);
        self.foreground.stop();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.selected.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
