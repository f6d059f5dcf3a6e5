use crate::{
    audit::AuditFeed,
    config::ControlConfig,
    dispatcher::{CommandDispatcher, CommandReceipt, CommandRequest},
    gateway::Gateway,
    http::HttpGateway,
    inflight::InflightTable,
    notice::{Notice, NoticeBoard},
    poller::{ForegroundPolling, PollOutcome, StatusPoller},
    registry::DeviceRegistry,
    scheduler::{Scheduler, TimerName},
    selection::SelectionDebouncer,
    session::Session,
    store::{StatusChange, StatusStore},
    verification::{VerificationEngine, VerificationProgress, VerificationReport},
};
use meterdeck_core::{
    wire::AuditEntry, ControlAction, ControlError, Device, DeviceStatus, OutputChannel,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Entry point that wires every component around one gateway and one session.
pub struct ControlCore {
    config: ControlConfig,
    session: Arc<Session>,
    store: Arc<StatusStore>,
    registry: Arc<DeviceRegistry>,
    inflight: Arc<InflightTable>,
    scheduler: Arc<Scheduler>,
    poller: Arc<StatusPoller>,
    foreground: Arc<ForegroundPolling>,
    selection: SelectionDebouncer,
    audit: Arc<AuditFeed>,
    dispatcher: Arc<CommandDispatcher>,
    verification: Arc<VerificationEngine>,
    notices: NoticeBoard,
}

impl ControlCore {
    pub fn new(gateway: Arc<dyn Gateway>, session: Arc<Session>, config: ControlConfig) -> Self {
        let store = Arc::new(StatusStore::new());
        let inflight = Arc::new(InflightTable::new());
        let scheduler = Scheduler::new();
        let notices = NoticeBoard::new();
        let registry = Arc::new(DeviceRegistry::new(gateway.clone(), session.clone()));
        let poller = Arc::new(StatusPoller::new(
            gateway.clone(),
            session.clone(),
            store.clone(),
            registry.clone(),
            inflight.clone(),
        ));
        let foreground = Arc::new(ForegroundPolling::new(
            poller.clone(),
            scheduler.clone(),
            config.status_poll_interval(),
        ));
        let selection = SelectionDebouncer::new(
            poller.clone(),
            foreground.clone(),
            inflight.clone(),
            scheduler.clone(),
            config.debounce(),
        );
        let audit = Arc::new(AuditFeed::new(
            gateway.clone(),
            session.clone(),
            inflight.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            gateway.clone(),
            session.clone(),
            store.clone(),
            poller.clone(),
            audit.clone(),
            scheduler.clone(),
            notices.clone(),
            config.reconcile_offsets(),
            config.operator.clone(),
        ));
        let verification = Arc::new(VerificationEngine::new(
            gateway,
            session.clone(),
            dispatcher.clone(),
            inflight.clone(),
            scheduler.clone(),
            notices.clone(),
            config.verification.clone(),
        ));
        Self {
            config,
            session,
            store,
            registry,
            inflight,
            scheduler,
            poller,
            foreground,
            selection,
            audit,
            dispatcher,
            verification,
            notices,
        }
    }

    /// Builds the core on top of the HTTP gateway described by `config`.
    pub fn connect(config: ControlConfig) -> Self {
        let session = Arc::new(Session::new(config.credential.clone()));
        let gateway = Arc::new(HttpGateway::new(&config, session.clone()));
        info!(event = "control_connect", gateway_url = %config.gateway_url);
        Self::new(gateway, session, config)
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn load_devices(&self, force: bool) -> Result<Arc<Vec<Device>>, ControlError> {
        self.registry.load_devices(force).await
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.registry.device(device_id)
    }

    pub fn get_status(&self, device_id: &str) -> DeviceStatus {
        self.store.get_status(device_id)
    }

    pub async fn fetch_status(&self, device_id: &str) -> Result<PollOutcome, ControlError> {
        self.poller.fetch_status(device_id).await
    }

    pub async fn fetch_outputs(&self, device_id: &str) -> Result<Vec<OutputChannel>, ControlError> {
        self.poller.fetch_outputs(device_id).await
    }

    /// Looks an output up by key or address, fetching the device's outputs if needed.
    pub async fn resolve_output(
        &self,
        device_id: &str,
        key_or_address: &str,
    ) -> Result<Option<OutputChannel>, ControlError> {
        self.poller.fetch_outputs(device_id).await?;
        Ok(self.registry.resolve_output(device_id, key_or_address))
    }

    pub fn select(&self, device_id: &str) {
        self.selection.select(device_id);
    }

    pub fn selected(&self) -> Option<String> {
        self.selection.selected()
    }

    pub fn clear_selection(&self) {
        self.selection.clear();
    }

    pub fn set_visible(&self, visible: bool) {
        self.foreground.set_visible(visible);
    }

    pub fn is_polling(&self) -> bool {
        self.foreground.is_polling()
    }

    pub fn start_audit_refresh(&self) {
        let audit = self.audit.clone();
        self.scheduler.every(
            TimerName::AuditLog,
            self.config.audit_refresh_interval(),
            move || {
                let audit = audit.clone();
                async move {
                    let _ = audit.refresh().await;
                }
            },
        );
    }

    pub fn stop_audit_refresh(&self) {
        self.scheduler.cancel(&TimerName::AuditLog);
    }

    pub async fn refresh_audit_log(&self) -> Result<Vec<AuditEntry>, ControlError> {
        self.audit.refresh().await
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    pub fn audit_entries_for(&self, device_id: &str) -> Vec<AuditEntry> {
        self.audit.entries_for(device_id)
    }

    pub async fn execute(&self, request: CommandRequest) -> Result<CommandReceipt, ControlError> {
        self.dispatcher.execute(request).await
    }

    pub fn pending_action(&self, device_id: &str, key: &str) -> Option<ControlAction> {
        self.dispatcher.pending_action(device_id, key)
    }

    pub async fn verify(&self, request: CommandRequest) -> VerificationReport {
        self.verification.verify(request).await
    }

    pub fn spawn_verification(&self, request: CommandRequest) -> u64 {
        self.verification.spawn(request)
    }

    pub fn verification_report(&self, verification_id: u64) -> Option<VerificationReport> {
        self.verification.report(verification_id)
    }

    pub fn verification_history(&self) -> Vec<VerificationReport> {
        self.verification.history()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.store.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn subscribe_verification(&self) -> watch::Receiver<Option<VerificationProgress>> {
        self.verification.subscribe()
    }

    /// Cancels every timer and in-flight request owned by this core.
    pub fn shutdown(&self) {
        self.selection.clear();
        let timers = self.scheduler.cancel_all();
        let requests = self.inflight.cancel_all();
        info!(event = "control_shutdown", timers, requests);
    }
}

impl Drop for ControlCore {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
        self.inflight.cancel_all();
    }
}
