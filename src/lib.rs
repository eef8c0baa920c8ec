//! Core library for the autopower tester.
//!
//! Runs repeated power-failure tests on mobile devices: programs GPIB power
//! supplies, captures the current each device draws, classifies the trace
//! against per-model criteria and logs the result. The orchestrator runs as a
//! background task and talks to its consumer (the `autopower` CLI, or any
//! other front end) only through the progress and control channels in
//! [`messages`].

pub mod config;
pub mod console;
pub mod criteria;
pub mod dispatch;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod measurement;
pub mod messages;
pub mod orchestrator;
pub mod sink;

pub use config::{AppConfig, BusAddress, ModelProfile, Thresholds};
pub use error::{AppResult, TesterError};
pub use measurement::{FailureCategory, Imei, RunResult, Verdict};
pub use messages::RunEntry;
pub use orchestrator::{spawn, Orchestrator, OrchestratorHandle};
