use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

const NOTICE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NoticeLevel::Success => "success",
            NoticeLevel::Info => "info",
            NoticeLevel::Error => "error",
        })
    }
}

/// Operator-facing outcome message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn new(level: NoticeLevel, device_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            device_id: device_id.map(str::to_string),
            at: Utc::now(),
        }
    }

    pub fn success(device_id: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, Some(device_id), message)
    }

    pub fn info(device_id: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, Some(device_id), message)
    }

    pub fn error(device_id: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, Some(device_id), message)
    }
}

/// Fan-out of notices; publishing with no subscriber is not an error.
#[derive(Clone)]
pub struct NoticeBoard {
    tx: broadcast::Sender<Notice>,
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBoard {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}
