use crate::{
    config::VerificationConfig,
    dispatcher::{CommandDispatcher, CommandRequest},
    gateway::Gateway,
    inflight::{InflightTable, RequestClass},
    notice::{Notice, NoticeBoard},
    scheduler::{Scheduler, TimerName},
    session::Session,
};
use meterdeck_core::{wire::TelemetrySample, ControlAction, ControlError};
use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

const HISTORY_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Idle,
    BaselineCaptured,
    CommandSent,
    Sampling,
    Succeeded,
    Failed,
    Errored,
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationState::Succeeded | VerificationState::Failed | VerificationState::Errored
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Success,
    Failure,
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Success => "success",
            Verdict::Failure => "failure",
            Verdict::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationProgress {
    pub verification_id: u64,
    pub device_id: String,
    pub state: VerificationState,
}

/// Evidence gathered by one verification run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub verification_id: u64,
    pub device_id: String,
    pub action: ControlAction,
    pub state: VerificationState,
    pub verdict: Verdict,
    pub baseline: Option<TelemetrySample>,
    pub final_sample: Option<TelemetrySample>,
    /// Measured from the command acknowledgement, or from the start of the run when the
    /// command never landed.
    pub elapsed_ms: u64,
    pub samples: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// True when the sample shows the physical effect of `action`.
pub fn transition_observed(
    action: ControlAction,
    sample: &TelemetrySample,
    baseline: Option<&TelemetrySample>,
    limits: &VerificationConfig,
) -> bool {
    let current = sample.current_avg;
    let power = sample.power_total;
    if action.energizes() {
        let above_floor = current.is_some_and(|amps| amps > limits.on_current_amps)
            || power.is_some_and(|kw| kw > limits.on_power_kw);
        let above_baseline = match (current, baseline.and_then(|b| b.current_avg)) {
            (Some(amps), Some(before)) if before > 0.0 => {
                amps >= before * limits.baseline_multiplier
            }
            _ => false,
        };
        above_floor || above_baseline
    } else {
        current.is_some_and(|amps| amps < limits.off_current_amps)
            || power.is_some_and(|kw| kw < limits.off_power_kw)
    }
}

struct RunOutcome {
    state: VerificationState,
    final_sample: Option<TelemetrySample>,
    samples: u32,
    elapsed: Duration,
    error: Option<String>,
    cancelled: bool,
}

pub struct VerificationEngine {
    gateway: Arc<dyn Gateway>,
    session: Arc<Session>,
    dispatcher: Arc<CommandDispatcher>,
    inflight: Arc<InflightTable>,
    scheduler: Arc<Scheduler>,
    notices: NoticeBoard,
    limits: VerificationConfig,
    next_id: AtomicU64,
    history: Mutex<VecDeque<VerificationReport>>,
    progress: watch::Sender<Option<VerificationProgress>>,
}

impl VerificationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        session: Arc<Session>,
        dispatcher: Arc<CommandDispatcher>,
        inflight: Arc<InflightTable>,
        scheduler: Arc<Scheduler>,
        notices: NoticeBoard,
        limits: VerificationConfig,
    ) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            gateway,
            session,
            dispatcher,
            inflight,
            scheduler,
            notices,
            limits,
            next_id: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            progress,
        }
    }

    /// Runs a full verification and returns its report.
    pub async fn verify(&self, request: CommandRequest) -> VerificationReport {
        let verification_id = self.allocate_id();
        self.run(verification_id, request).await
    }

    /// Starts a verification in the background; the report lands in [`Self::history`].
    pub fn spawn(self: &Arc<Self>, request: CommandRequest) -> u64 {
        let verification_id = self.allocate_id();
        let engine = self.clone();
        self.scheduler.after(
            TimerName::Verification(verification_id),
            Duration::ZERO,
            async move {
                engine.run(verification_id, request).await;
            },
        );
        verification_id
    }

    pub fn cancel(&self, verification_id: u64) -> bool {
        self.scheduler
            .cancel(&TimerName::Verification(verification_id))
    }

    pub fn report(&self, verification_id: u64) -> Option<VerificationReport> {
        self.lock_history()
            .iter()
            .find(|report| report.verification_id == verification_id)
            .cloned()
    }

    /// Most recent reports, newest last.
    pub fn history(&self) -> Vec<VerificationReport> {
        self.lock_history().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<VerificationProgress>> {
        self.progress.subscribe()
    }

    async fn run(&self, verification_id: u64, request: CommandRequest) -> VerificationReport {
        let started = Instant::now();
        let device_id = request.device_id.clone();
        let action = request.action;
        self.set_state(verification_id, &device_id, VerificationState::Idle);

        let baseline = match self.sample(verification_id, &device_id).await {
            Ok(sample) => Some(sample),
            Err(err) => {
                debug!(event = "verification_baseline_unavailable", device_id = %device_id, error = %err);
                None
            }
        };
        self.set_state(verification_id, &device_id, VerificationState::BaselineCaptured);

        let outcome = match self.dispatcher.execute(request).await {
            Err(err) => RunOutcome {
                state: VerificationState::Errored,
                final_sample: None,
                samples: 0,
                elapsed: started.elapsed(),
                error: Some(err.to_string()),
                cancelled: false,
            },
            Ok(_) => {
                self.set_state(verification_id, &device_id, VerificationState::CommandSent);
                self.sample_until_settled(verification_id, &device_id, action, baseline.as_ref())
                    .await
            }
        };

        let verdict = match outcome.state {
            VerificationState::Succeeded => Verdict::Success,
            VerificationState::Failed => Verdict::Failure,
            _ => Verdict::Error,
        };
        let report = VerificationReport {
            verification_id,
            device_id: device_id.clone(),
            action,
            state: outcome.state,
            verdict,
            baseline,
            final_sample: outcome.final_sample,
            elapsed_ms: u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            samples: outcome.samples,
            error: outcome.error,
        };
        self.set_state(verification_id, &device_id, report.state);
        self.finish(&report, outcome.cancelled);
        report
    }

    async fn sample_until_settled(
        &self,
        verification_id: u64,
        device_id: &str,
        action: ControlAction,
        baseline: Option<&TelemetrySample>,
    ) -> RunOutcome {
        let acknowledged = Instant::now();
        let deadline = acknowledged + self.limits.timeout();
        let expiry = time::sleep_until(deadline);
        tokio::pin!(expiry);
        let mut ticker = time::interval(self.limits.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.set_state(verification_id, device_id, VerificationState::Sampling);

        let mut samples = 0u32;
        let mut final_sample = None;
        let mut cancelled = false;
        let (state, error) = loop {
            tokio::select! {
                biased;
                _ = &mut expiry => break (VerificationState::Failed, None),
                _ = ticker.tick() => {}
            }
            let sampled = time::timeout_at(deadline, self.sample(verification_id, device_id));
            let sample = match sampled.await {
                Err(_elapsed) => break (VerificationState::Failed, None),
                Ok(Ok(sample)) => sample,
                Ok(Err(err)) if err.is_cancelled() => {
                    cancelled = true;
                    break (VerificationState::Errored, Some(err.to_string()));
                }
                Ok(Err(err)) if err.is_unauthorized() => {
                    break (VerificationState::Errored, Some(err.to_string()));
                }
                Ok(Err(err)) => {
                    debug!(event = "verification_sample_failed", device_id, code = err.code(), error = %err);
                    continue;
                }
            };
            samples += 1;
            let settled = transition_observed(action, &sample, baseline, &self.limits);
            final_sample = Some(sample);
            if settled {
                break (VerificationState::Succeeded, None);
            }
        };
        RunOutcome {
            state,
            final_sample,
            samples,
            elapsed: acknowledged.elapsed(),
            error,
            cancelled,
        }
    }

    /// Each run owns its telemetry slot, so runs on one device never cancel each other.
    async fn sample(
        &self,
        verification_id: u64,
        device_id: &str,
    ) -> Result<TelemetrySample, ControlError> {
        let scope = format!("{device_id}#verification-{verification_id}");
        let mut guard = self
            .inflight
            .begin_superseding(&scope, RequestClass::Telemetry);
        let result = guard.run(self.gateway.telemetry(device_id)).await;
        self.session.screen(result)
    }

    fn finish(&self, report: &VerificationReport, cancelled: bool) {
        match report.verdict {
            Verdict::Error if cancelled => {
                debug!(
                    event = "verification_cancelled",
                    verification_id = report.verification_id,
                    device_id = %report.device_id,
                    samples = report.samples
                );
            }
            Verdict::Success => {
                info!(
                    event = "verification_verdict",
                    verification_id = report.verification_id,
                    device_id = %report.device_id,
                    verdict = %report.verdict,
                    elapsed_ms = report.elapsed_ms,
                    samples = report.samples
                );
                self.notices.publish(Notice::success(
                    &report.device_id,
                    format!("{} confirmed after {} ms", report.action, report.elapsed_ms),
                ));
            }
            Verdict::Failure => {
                warn!(
                    event = "verification_verdict",
                    verification_id = report.verification_id,
                    device_id = %report.device_id,
                    verdict = %report.verdict,
                    elapsed_ms = report.elapsed_ms,
                    samples = report.samples
                );
                self.notices.publish(Notice::error(
                    &report.device_id,
                    format!(
                        "{} not confirmed by telemetry within {} ms",
                        report.action, self.limits.timeout_ms
                    ),
                ));
            }
            Verdict::Error => {
                let error = report.error.as_deref().unwrap_or("unknown error");
                warn!(
                    event = "verification_verdict",
                    verification_id = report.verification_id,
                    device_id = %report.device_id,
                    verdict = %report.verdict,
                    error
                );
                self.notices.publish(Notice::error(
                    &report.device_id,
                    format!("{} verification errored: {error}", report.action),
                ));
            }
        }

        let mut history = self.lock_history();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(report.clone());
    }

    fn set_state(&self, verification_id: u64, device_id: &str, state: VerificationState) {
        debug!(event = "verification_state", verification_id, device_id, state = ?state);
        self.progress.send_replace(Some(VerificationProgress {
            verification_id,
            device_id: device_id.to_string(),
            state,
        }));
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<VerificationReport>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
