use futures_util::future::{AbortHandle, AbortRegistration, Abortable};
use meterdeck_core::ControlError;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

pub const AUDIT_SCOPE: &str = "@audit-log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Status,
    Outputs,
    Logs,
    Telemetry,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Status => "status",
            RequestClass::Outputs => "outputs",
            RequestClass::Logs => "logs",
            RequestClass::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    scope: String,
    class: RequestClass,
}

struct Slot {
    generation: u64,
    /// Caller-supplied issuance order; zero when the caller does not order its requests.
    stamp: u64,
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl Slot {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }
}

/// One live request handle per (scope, class).
#[derive(Default)]
pub struct InflightTable {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    generation: AtomicU64,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for a request stamped `stamp` unless a request already holds it.
    /// A holder stamped at or below `floor` is cancelled and replaced instead.
    pub fn try_begin(
        self: &Arc<Self>,
        scope: &str,
        class: RequestClass,
        stamp: u64,
        floor: u64,
    ) -> Option<InflightGuard> {
        let key = SlotKey {
            scope: scope.to_string(),
            class,
        };
        let mut slots = self.lock();
        if let Some(holder) = slots.get(&key) {
            if holder.stamp > floor {
                return None;
            }
            if let Some(previous) = slots.remove(&key) {
                previous.cancel();
            }
        }
        Some(self.install(&mut slots, key, stamp))
    }

    /// Claims the slot, cancelling whichever request held it before.
    pub fn begin_superseding(self: &Arc<Self>, scope: &str, class: RequestClass) -> InflightGuard {
        let key = SlotKey {
            scope: scope.to_string(),
            class,
        };
        let mut slots = self.lock();
        if let Some(previous) = slots.remove(&key) {
            previous.cancel();
        }
        self.install(&mut slots, key, 0)
    }

    pub fn cancel(&self, scope: &str, class: RequestClass) -> bool {
        let key = SlotKey {
            scope: scope.to_string(),
            class,
        };
        match self.lock().remove(&key) {
            Some(slot) => {
                slot.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Slot> = self.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.cancel();
        }
        drained.len()
    }

    pub fn is_in_flight(&self, scope: &str, class: RequestClass) -> bool {
        self.lock().contains_key(&SlotKey {
            scope: scope.to_string(),
            class,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(
        self: &Arc<Self>,
        slots: &mut HashMap<SlotKey, Slot>,
        key: SlotKey,
        stamp: u64,
    ) -> InflightGuard {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (abort, registration) = AbortHandle::new_pair();
        let cancelled = Arc::new(AtomicBool::new(false));
        slots.insert(
            key.clone(),
            Slot {
                generation,
                stamp,
                abort,
                cancelled: cancelled.clone(),
            },
        );
        InflightGuard {
            table: self.clone(),
            key,
            generation,
            cancelled,
            registration: Some(registration),
        }
    }

    fn release(&self, key: &SlotKey, generation: u64) {
        let mut slots = self.lock();
        if slots
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.remove(key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds a claimed slot; dropping it frees the slot on every exit path.
pub struct InflightGuard {
    table: Arc<InflightTable>,
    key: SlotKey,
    generation: u64,
    cancelled: Arc<AtomicBool>,
    registration: Option<AbortRegistration>,
}

impl InflightGuard {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn scope(&self) -> &str {
        &self.key.scope
    }

    /// Drives the request under this handle. A settlement that lands after a cancel
    /// request is reported as [`ControlError::Cancelled`].
    pub async fn run<T, F>(&mut self, request: F) -> Result<T, ControlError>
    where
        F: Future<Output = Result<T, ControlError>>,
    {
        let Some(registration) = self.registration.take() else {
            return Err(ControlError::Cancelled);
        };
        match Abortable::new(request, registration).await {
            Err(_aborted) => Err(ControlError::Cancelled),
            Ok(_) if self.is_cancelled() => Err(ControlError::Cancelled),
            Ok(result) => result,
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.release(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn try_begin_refuses_while_slot_is_held_and_frees_on_drop() {
        let table = Arc::new(InflightTable::new());
        let guard = table
            .try_begin("meter-1", RequestClass::Status, 1, 0)
            .expect("first claim");
        assert!(table.try_begin("meter-1", RequestClass::Status, 1, 0).is_none());
        assert!(table.try_begin("meter-1", RequestClass::Outputs, 1, 0).is_some());
        assert!(table.is_in_flight("meter-1", RequestClass::Status));

        drop(guard);
        assert!(!table.is_in_flight("meter-1", RequestClass::Status));
        assert!(table.try_begin("meter-1", RequestClass::Status, 1, 0).is_some());
    }

    #[test]
    fn superseded_guard_does_not_release_the_new_slot() {
        let table = Arc::new(InflightTable::new());
        let old = table.begin_superseding("meter-1", RequestClass::Outputs);
        let new = table.begin_superseding("meter-1", RequestClass::Outputs);
        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());

        drop(old);
        assert!(table.is_in_flight("meter-1", RequestClass::Outputs));
        drop(new);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_resolves_as_cancelled() {
        let table = Arc::new(InflightTable::new());
        let mut guard = table
            .try_begin("meter-1", RequestClass::Status, 1, 0)
            .expect("claim");
        let canceller = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel("meter-1", RequestClass::Status);
        });

        let result = guard
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ControlError>(7)
            })
            .await;
        assert_eq!(result, Err(ControlError::Cancelled));
    }

    #[tokio::test]
    async fn settlement_after_cancel_flag_is_discarded() {
        let table = Arc::new(InflightTable::new());
        let mut guard = table
            .try_begin("meter-1", RequestClass::Status, 1, 0)
            .expect("claim");
        let result = guard
            .run(async {
                table.cancel("meter-1", RequestClass::Status);
                Ok::<_, ControlError>(7)
            })
            .await;
        assert_eq!(result, Err(ControlError::Cancelled));
    }

    #[test]
    fn stamped_claim_replaces_only_holders_at_or_below_the_floor() {
        let table = Arc::new(InflightTable::new());
        let early = table
            .try_begin("meter-1", RequestClass::Status, 3, 0)
            .expect("empty slot");

        // Nothing was written after the holder was issued: the newcomer backs off.
        assert!(table
            .try_begin("meter-1", RequestClass::Status, 5, 2)
            .is_none());
        assert!(!early.is_cancelled());

        // A write stamped 4 landed after the holder; its answer can only be stale.
        let late = table
            .try_begin("meter-1", RequestClass::Status, 6, 4)
            .expect("replaces stale holder");
        assert!(early.is_cancelled());
        assert!(!late.is_cancelled());

        drop(early);
        assert!(table.is_in_flight("meter-1", RequestClass::Status));
        drop(late);
        assert!(table.is_empty());
    }

    #[test]
    fn cancel_all_drains_every_scope() {
        let table = Arc::new(InflightTable::new());
        let a_status = table.try_begin("meter-a", RequestClass::Status, 1, 0).expect("a");
        let a_outputs = table.try_begin("meter-a", RequestClass::Outputs, 1, 0).expect("a");
        let b_status = table.try_begin("meter-b", RequestClass::Status, 1, 0).expect("b");

        assert!(table.cancel("meter-a", RequestClass::Outputs));
        assert!(a_outputs.is_cancelled());
        assert!(!a_status.is_cancelled());
        assert_eq!(table.len(), 2);
        assert_eq!(table.cancel_all(), 2);
        assert!(a_status.is_cancelled());
        assert!(b_status.is_cancelled());
        assert!(table.is_empty());
    }
}
