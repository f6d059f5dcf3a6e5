//! Device control and verification core: status polling, debounced selection, command
//! dispatch with optimistic reconciliation and telemetry-backed verification.

pub mod audit;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod gateway;
pub mod http;
pub mod inflight;
pub mod notice;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod store;
pub mod verification;

pub use config::{ConfigError, ControlConfig};
pub use control::ControlCore;
pub use dispatcher::{CommandReceipt, CommandRequest};
pub use gateway::{Gateway, GatewayFuture};
pub use http::HttpGateway;
pub use notice::{Notice, NoticeLevel};
pub use poller::PollOutcome;
pub use session::{Session, SessionState};
pub use store::{StatusChange, Ticket};
pub use verification::{Verdict, VerificationReport, VerificationState};

pub use meterdeck_core::{
    wire, ControlAction, ControlError, Device, DeviceStatus, OutputChannel, StatusRecord,
    StatusTag,
};
