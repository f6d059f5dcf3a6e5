use chrono::Utc;
use meterdeck_core::{ControlAction, DeviceStatus, StatusRecord};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Issuance order of a store write. Drawn before the request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    Committed {
        device_id: String,
        ticket: Ticket,
    },
    Optimistic {
        device_id: String,
        key: String,
        ticket: Ticket,
    },
}

impl StatusChange {
    pub fn device_id(&self) -> &str {
        match self {
            StatusChange::Committed { device_id, .. } => device_id,
            StatusChange::Optimistic { device_id, .. } => device_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// A write issued later already landed; this one was dropped.
    Stale { latest: Ticket },
}

struct DeviceEntry {
    records: DeviceStatus,
    ticket: Ticket,
}

/// Last-known status per device, shared by every consumer.
pub struct StatusStore {
    devices: Mutex<HashMap<String, DeviceEntry>>,
    next_ticket: AtomicU64,
    changes: broadcast::Sender<StatusChange>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            devices: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            changes,
        }
    }

    pub fn issue_ticket(&self) -> Ticket {
        Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn get_status(&self, device_id: &str) -> DeviceStatus {
        self.lock()
            .get(device_id)
            .map(|entry| entry.records.clone())
            .unwrap_or_default()
    }

    pub fn record(&self, device_id: &str, key: &str) -> Option<StatusRecord> {
        self.lock()
            .get(device_id)
            .and_then(|entry| entry.records.get(key).cloned())
    }

    pub fn last_ticket(&self, device_id: &str) -> Option<Ticket> {
        self.lock().get(device_id).map(|entry| entry.ticket)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Replaces the device's records with a confirmed snapshot, clearing every pending
    /// marker, unless a later-issued write already landed.
    pub fn commit(&self, device_id: &str, ticket: Ticket, records: DeviceStatus) -> CommitOutcome {
        {
            let mut devices = self.lock();
            if let Some(entry) = devices.get_mut(device_id) {
                if ticket <= entry.ticket {
                    debug!(
                        event = "status_commit_stale",
                        device_id,
                        ticket = ticket.value(),
                        latest = entry.ticket.value()
                    );
                    return CommitOutcome::Stale {
                        latest: entry.ticket,
                    };
                }
                entry.records = records;
                entry.ticket = ticket;
            } else {
                devices.insert(device_id.to_string(), DeviceEntry { records, ticket });
            }
        }
        let _ = self.changes.send(StatusChange::Committed {
            device_id: device_id.to_string(),
            ticket,
        });
        CommitOutcome::Applied
    }

    /// Writes a pending record for one output ahead of confirmation. The write draws its
    /// own ticket, so polls issued before it cannot roll it back.
    pub fn apply_optimistic(&self, device_id: &str, key: &str, action: ControlAction) -> Ticket {
        let ticket = self.issue_ticket();
        {
            let mut devices = self.lock();
            let entry = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceEntry {
                    records: DeviceStatus::new(),
                    ticket,
                });
            entry
                .records
                .insert(key.to_string(), StatusRecord::optimistic(action, Utc::now()));
            entry.ticket = ticket;
        }
        let _ = self.changes.send(StatusChange::Optimistic {
            device_id: device_id.to_string(),
            key: key.to_string(),
            ticket,
        });
        ticket
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceEntry>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
