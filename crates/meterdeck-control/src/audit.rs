use crate::{
    gateway::Gateway,
    inflight::{InflightTable, RequestClass, AUDIT_SCOPE},
    poller::report_failure,
    session::Session,
};
use meterdeck_core::{wire::AuditEntry, ControlError};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Cached copy of the gateway's command audit log.
pub struct AuditFeed {
    gateway: Arc<dyn Gateway>,
    session: Arc<Session>,
    inflight: Arc<InflightTable>,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditFeed {
    pub fn new(gateway: Arc<dyn Gateway>, session: Arc<Session>, inflight: Arc<InflightTable>) -> Self {
        Self {
            gateway,
            session,
            inflight,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Fetches the log, superseding any refresh still in flight.
    pub async fn refresh(&self) -> Result<Vec<AuditEntry>, ControlError> {
        let mut guard = self.inflight.begin_superseding(AUDIT_SCOPE, RequestClass::Logs);
        let result = guard.run(self.gateway.audit_log()).await;
        drop(guard);

        match self.session.screen(result) {
            Ok(entries) => {
                debug!(event = "audit_log_refreshed", count = entries.len());
                *self.lock() = entries.clone();
                Ok(entries)
            }
            Err(err) => {
                report_failure("audit_log_failed", AUDIT_SCOPE, &err);
                Err(err)
            }
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    pub fn entries_for(&self, device_id: &str) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|entry| entry.device_id == device_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
