use crate::{
    gateway::Gateway,
    inflight::{InflightTable, RequestClass},
    registry::DeviceRegistry,
    scheduler::{Scheduler, TimerName},
    session::Session,
    store::{CommitOutcome, StatusStore, Ticket},
};
use meterdeck_core::{wire::StatusResponse, ControlError, OutputChannel};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Committed(Ticket),
    /// The response arrived after a later-issued write; nothing changed.
    Stale,
    /// A status request issued after the device's last write was already in flight.
    Skipped,
}

pub struct StatusPoller {
    gateway: Arc<dyn Gateway>,
    session: Arc<Session>,
    store: Arc<StatusStore>,
    registry: Arc<DeviceRegistry>,
    inflight: Arc<InflightTable>,
}

impl StatusPoller {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        session: Arc<Session>,
        store: Arc<StatusStore>,
        registry: Arc<DeviceRegistry>,
        inflight: Arc<InflightTable>,
    ) -> Self {
        Self {
            gateway,
            session,
            store,
            registry,
            inflight,
        }
    }

    pub async fn fetch_status(&self, device_id: &str) -> Result<PollOutcome, ControlError> {
        // An in-flight request issued before the device's last write can only land
        // stale, so it gives way; a fresher one makes this call a no-op.
        let ticket = self.store.issue_ticket();
        let floor = self.store.last_ticket(device_id).map_or(0, |last| last.value());
        let Some(mut guard) =
            self.inflight
                .try_begin(device_id, RequestClass::Status, ticket.value(), floor)
        else {
            debug!(event = "status_fetch_skipped", device_id);
            return Ok(PollOutcome::Skipped);
        };
        let result = guard
            .run(self.gateway.device_status(device_id))
            .await
            .and_then(StatusResponse::into_records);
        drop(guard);

        match self.session.screen(result) {
            Ok(records) => match self.store.commit(device_id, ticket, records) {
                CommitOutcome::Applied => {
                    debug!(event = "status_commit", device_id, ticket = ticket.value());
                    Ok(PollOutcome::Committed(ticket))
                }
                CommitOutcome::Stale { .. } => Ok(PollOutcome::Stale),
            },
            Err(err) => {
                report_failure("status_fetch_failed", device_id, &err);
                Err(err)
            }
        }
    }

    /// Outputs are fetched once per device and cached for the session.
    pub async fn fetch_outputs(&self, device_id: &str) -> Result<Vec<OutputChannel>, ControlError> {
        if let Some(outputs) = self.registry.cached_outputs(device_id) {
            return Ok(outputs);
        }
        let mut guard = self
            .inflight
            .begin_superseding(device_id, RequestClass::Outputs);
        let result = guard.run(self.gateway.device_outputs(device_id)).await;
        drop(guard);

        match self.session.screen(result) {
            Ok(outputs) => {
                debug!(event = "outputs_cached", device_id, count = outputs.len());
                self.registry.store_outputs(device_id, outputs.clone());
                Ok(outputs)
            }
            Err(err) => {
                report_failure("outputs_fetch_failed", device_id, &err);
                Err(err)
            }
        }
    }
}

pub(crate) fn report_failure(event: &'static str, scope: &str, err: &ControlError) {
    match err {
        ControlError::Cancelled => debug!(event, scope, "request cancelled"),
        other => warn!(event, scope, code = other.code(), error = %other),
    }
}

#[derive(Default)]
struct ForegroundState {
    focused: Option<String>,
    visible: bool,
}

/// Keeps the focused device's status fresh while the view is visible.
pub struct ForegroundPolling {
    poller: Arc<StatusPoller>,
    scheduler: Arc<Scheduler>,
    interval: Duration,
    state: Mutex<ForegroundState>,
}

impl ForegroundPolling {
    pub fn new(poller: Arc<StatusPoller>, scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self {
            poller,
            scheduler,
            interval,
            state: Mutex::new(ForegroundState {
                focused: None,
                visible: true,
            }),
        }
    }

    pub fn focus(&self, device_id: &str) {
        self.lock().focused = Some(device_id.to_string());
        self.reschedule();
    }

    pub fn set_visible(&self, visible: bool) {
        {
            let mut state = self.lock();
            if state.visible == visible {
                return;
            }
            state.visible = visible;
        }
        debug!(event = "foreground_visibility", visible);
        self.reschedule();
    }

    pub fn stop(&self) {
        self.lock().focused = None;
        self.scheduler.cancel(&TimerName::ForegroundStatus);
    }

    pub fn focused(&self) -> Option<String> {
        self.lock().focused.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    pub fn is_polling(&self) -> bool {
        self.scheduler.is_active(&TimerName::ForegroundStatus)
    }

    fn reschedule(&self) {
        let target = {
            let state = self.lock();
            state.focused.clone().filter(|_| state.visible)
        };
        let Some(device_id) = target else {
            self.scheduler.cancel(&TimerName::ForegroundStatus);
            return;
        };
        let poller = self.poller.clone();
        self.scheduler
            .every(TimerName::ForegroundStatus, self.interval, move || {
                let poller = poller.clone();
                let device_id = device_id.clone();
                async move {
                    let _ = poller.fetch_status(&device_id).await;
                }
            });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ForegroundState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
