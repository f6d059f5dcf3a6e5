use crate::{
    audit::AuditFeed,
    gateway::Gateway,
    notice::{Notice, NoticeBoard},
    poller::StatusPoller,
    scheduler::{Scheduler, TimerName},
    session::Session,
    store::{StatusStore, Ticket},
};
use meterdeck_core::{
    wire::{ExecuteRequest, ExecuteResponse, DEFAULT_CONTROL_MODE},
    ControlAction, ControlError,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub device_id: String,
    pub action: ControlAction,
    pub target: String,
    pub address: Option<String>,
    pub output_key: Option<String>,
    pub control_mode: Option<String>,
    pub reason: String,
    /// Falls back to the configured operator when empty.
    pub operator: String,
}

impl CommandRequest {
    pub fn new(device_id: impl Into<String>, action: ControlAction, target: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            action,
            target: target.into(),
            address: None,
            output_key: None,
            control_mode: None,
            reason: String::new(),
            operator: String::new(),
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.device_id.trim().is_empty() {
            return Err(ControlError::InvalidRequest("device id is required".to_string()));
        }
        if self.target.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "control target is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Store key for the optimistic record: output key, then address, then target.
    pub fn optimistic_key(&self) -> &str {
        [self.output_key.as_deref(), self.address.as_deref()]
            .into_iter()
            .flatten()
            .find(|candidate| !candidate.trim().is_empty())
            .unwrap_or(&self.target)
    }

    pub fn to_wire(&self, default_operator: &str) -> ExecuteRequest {
        let operator = if self.operator.trim().is_empty() {
            default_operator
        } else {
            &self.operator
        };
        ExecuteRequest {
            device_id: self.device_id.clone(),
            control_mode: self
                .control_mode
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTROL_MODE.to_string()),
            control_target: self.target.clone(),
            action: self.action,
            reason: self.reason.clone(),
            operator: operator.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandReceipt {
    pub command_id: u64,
    pub device_id: String,
    pub key: String,
    pub action: ControlAction,
    pub ticket: Ticket,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    command_id: u64,
    action: ControlAction,
}

type PendingCommands = Arc<Mutex<HashMap<(String, String), PendingCommand>>>;

pub struct CommandDispatcher {
    gateway: Arc<dyn Gateway>,
    session: Arc<Session>,
    store: Arc<StatusStore>,
    poller: Arc<StatusPoller>,
    audit: Arc<AuditFeed>,
    scheduler: Arc<Scheduler>,
    notices: NoticeBoard,
    offsets: Vec<Duration>,
    operator: String,
    pending: PendingCommands,
    next_command_id: AtomicU64,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        session: Arc<Session>,
        store: Arc<StatusStore>,
        poller: Arc<StatusPoller>,
        audit: Arc<AuditFeed>,
        scheduler: Arc<Scheduler>,
        notices: NoticeBoard,
        offsets: Vec<Duration>,
        operator: String,
    ) -> Self {
        Self {
            gateway,
            session,
            store,
            poller,
            audit,
            scheduler,
            notices,
            offsets,
            operator,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_command_id: AtomicU64::new(0),
        }
    }

    /// Sends the command; on acknowledgement writes the optimistic record and schedules
    /// the reconciliation burst. Transport failures are reported, never retried.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandReceipt, ControlError> {
        if let Err(err) = request.validate() {
            warn!(event = "command_invalid", device_id = %request.device_id, error = %err);
            self.notices.publish(Notice::error(&request.device_id, err.to_string()));
            return Err(err);
        }

        let wire = request.to_wire(&self.operator);
        let result = self
            .session
            .screen(self.gateway.execute(wire).await)
            .and_then(ExecuteResponse::into_result);
        if let Err(err) = result {
            warn!(
                event = "command_rejected",
                device_id = %request.device_id,
                target = %request.target,
                action = %request.action,
                code = err.code(),
                error = %err
            );
            self.notices.publish(Notice::error(
                &request.device_id,
                format!("{} {} failed: {err}", request.action, request.target),
            ));
            return Err(err);
        }

        let key = request.optimistic_key().to_string();
        let ticket = self
            .store
            .apply_optimistic(&request.device_id, &key, request.action);
        let command_id = self.next_command_id.fetch_add(1, Ordering::SeqCst) + 1;
        let superseded = self.lock_pending().insert(
            (request.device_id.clone(), key.clone()),
            PendingCommand {
                command_id,
                action: request.action,
            },
        );
        if let Some(previous) = superseded {
            debug!(
                event = "command_superseded",
                device_id = %request.device_id,
                key = %key,
                previous = previous.command_id,
                previous_action = %previous.action,
                command_id
            );
            self.notices.publish(Notice::info(
                &request.device_id,
                format!(
                    "{} {} replaces pending {}",
                    request.action, key, previous.action
                ),
            ));
        }
        self.schedule_reconcile(command_id, &request.device_id, &key);

        info!(
            event = "command_acknowledged",
            command_id,
            device_id = %request.device_id,
            key = %key,
            action = %request.action,
            ticket = ticket.value()
        );
        self.notices.publish(Notice::success(
            &request.device_id,
            format!("{} {} sent", request.action, request.target),
        ));
        Ok(CommandReceipt {
            command_id,
            device_id: request.device_id,
            key,
            action: request.action,
            ticket,
        })
    }

    /// Action of the newest acknowledged command still reconciling for the output.
    pub fn pending_action(&self, device_id: &str, key: &str) -> Option<ControlAction> {
        self.lock_pending()
            .get(&(device_id.to_string(), key.to_string()))
            .map(|pending| pending.action)
    }

    fn schedule_reconcile(&self, command_id: u64, device_id: &str, key: &str) {
        let started = Instant::now();
        let offsets = self.offsets.clone();
        let poller = self.poller.clone();
        let audit = self.audit.clone();
        let pending = self.pending.clone();
        let slot = (device_id.to_string(), key.to_string());
        self.scheduler.after(
            TimerName::Reconcile(command_id),
            Duration::ZERO,
            async move {
                for offset in &offsets {
                    time::sleep_until(started + *offset).await;
                    let _ = poller.fetch_status(&slot.0).await;
                }
                let _ = audit.refresh().await;

                let mut pending = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if pending
                    .get(&slot)
                    .is_some_and(|current| current.command_id == command_id)
                {
                    pending.remove(&slot);
                }
                debug!(event = "reconcile_finished", command_id, device_id = %slot.0);
            },
        );
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), PendingCommand>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimistic_key_prefers_output_key_then_address_then_target() {
        let request = CommandRequest::new("meter-1", ControlAction::Trip, "relay-target");
        assert_eq!(request.optimistic_key(), "relay-target");

        let request = request.with_address("0x10");
        assert_eq!(request.optimistic_key(), "0x10");

        let request = request.with_output_key("relay-1");
        assert_eq!(request.optimistic_key(), "relay-1");

        let blank = CommandRequest::new("meter-1", ControlAction::Close, "t").with_output_key(" ");
        assert_eq!(blank.optimistic_key(), "t");
    }

    #[test]
    fn validation_requires_device_and_target() {
        assert!(matches!(
            CommandRequest::new("", ControlAction::Trip, "relay").validate(),
            Err(ControlError::InvalidRequest(_))
        ));
        assert!(matches!(
            CommandRequest::new("meter-1", ControlAction::Trip, "  ").validate(),
            Err(ControlError::InvalidRequest(_))
        ));
        assert!(CommandRequest::new("meter-1", ControlAction::Trip, "relay")
            .validate()
            .is_ok());
    }

    #[test]
    fn wire_request_fills_mode_and_operator_defaults() {
        let wire = CommandRequest::new("meter-1", ControlAction::Close, "relay")
            .with_reason("maintenance done")
            .to_wire("desk-a");
        assert_eq!(wire.control_mode, DEFAULT_CONTROL_MODE);
        assert_eq!(wire.operator, "desk-a");
        assert_eq!(wire.reason, "maintenance done");

        let wire = CommandRequest::new("meter-1", ControlAction::Close, "relay")
            .with_operator("alice")
            .to_wire("desk-a");
        assert_eq!(wire.operator, "alice");
    }
}
