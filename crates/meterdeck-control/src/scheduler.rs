use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerName {
    ForegroundStatus,
    AuditLog,
    Selection,
    Reconcile(u64),
    Verification(u64),
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerName::ForegroundStatus => f.write_str("foreground_status"),
            TimerName::AuditLog => f.write_str("audit_log"),
            TimerName::Selection => f.write_str("selection"),
            TimerName::Reconcile(id) => write!(f, "reconcile:{id}"),
            TimerName::Verification(id) => write!(f, "verification:{id}"),
        }
    }
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Named, cancellable timers. Registering a name that is already active replaces the
/// old timer.
#[derive(Default)]
pub struct Scheduler {
    timers: Mutex<HashMap<TimerName, TimerEntry>>,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `task` every `period`, first tick one period from now. A tick never overlaps the
    /// previous run; late ticks are delayed rather than bunched.
    pub fn every<F, Fut>(self: &Arc<Self>, name: TimerName, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(event = "timer_tick", timer = %label);
                task().await;
            }
        });
        self.register(name, handle);
    }

    /// Runs `task` once after `delay`.
    pub fn after<Fut>(self: &Arc<Self>, name: TimerName, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation();
        let scheduler = Arc::downgrade(self);
        let finished_name = name.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            task.await;
            finish(scheduler, &finished_name, generation);
        });
        self.insert(name, generation, handle);
    }

    pub fn cancel(&self, name: &TimerName) -> bool {
        match self.lock().remove(name) {
            Some(entry) => {
                entry.handle.abort();
                debug!(event = "timer_cancelled", timer = %name);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<TimerEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    pub fn is_active(&self, name: &TimerName) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    fn register(&self, name: TimerName, handle: JoinHandle<()>) {
        let generation = self.next_generation();
        self.insert(name, generation, handle);
    }

    fn insert(&self, name: TimerName, generation: u64, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(name, TimerEntry { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TimerName, TimerEntry>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn finish(scheduler: Weak<Scheduler>, name: &TimerName, generation: u64) {
    let Some(scheduler) = scheduler.upgrade() else {
        return;
    };
    let mut timers = scheduler.lock();
    if timers
        .get(name)
        .is_some_and(|entry| entry.generation == generation)
    {
        timers.remove(name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn every_ticks_on_period_until_cancelled() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        scheduler.every(TimerName::ForegroundStatus, Duration::from_secs(2), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(4_200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel(&TimerName::ForegroundStatus));
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_active(&TimerName::ForegroundStatus));
    }

    #[tokio::test(start_paused = true)]
    async fn registering_same_name_replaces_previous_timer() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            scheduler.after(TimerName::Selection, Duration::from_millis(300), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_active(&TimerName::Selection));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_scheduler_aborts_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = Scheduler::new();
            let fired = fired.clone();
            scheduler.after(TimerName::Reconcile(1), Duration::from_secs(1), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
