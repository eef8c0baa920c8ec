//! Message types for orchestrator/consumer communication
//!
//! Two channels connect the orchestrator task with its consumer (a UI, the
//! CLI, a test):
//!
//! - **progress** (orchestrator → consumer): [`ProgressMessage`], a closed set
//!   of tagged messages delivered in emission order.
//! - **control** (consumer → orchestrator): [`ControlCommand`], the only way a
//!   consumer influences a run.
//!
//! Both are unbounded so the orchestrator never waits on the consumer.

use crate::config::ModelProfile;
use crate::error::{ConfigError, TesterError};
use crate::measurement::{FailureCategory, Imei, RunResult};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Orchestrator state, reported through [`ProgressMessage::PhaseChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No run in progress.
    Idle,
    /// Opening the supply and programming the voltage.
    Connecting,
    /// Waiting for current and sampling the observation window.
    Measuring,
    /// Paused until the operator confirms the device.
    AwaitingDeviceCheck,
    /// Classifying the captured trace.
    Evaluating,
    /// Handing the result to the sink.
    Recording,
    /// Abandoning the current model after a cancel.
    Cancelling,
    /// The current model hit an unrecoverable instrument error.
    Fatal,
}

impl Phase {
    /// Lower-case phase id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Measuring => "measuring",
            Self::AwaitingDeviceCheck => "awaiting_device_check",
            Self::Evaluating => "evaluating",
            Self::Recording => "recording",
            Self::Cancelling => "cancelling",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notifications sent to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMessage {
    /// Human-readable progress line.
    Status(String),
    /// The orchestrator entered a new phase.
    PhaseChange(Phase),
    /// Heartbeat during the observation window.
    Tick {
        /// Time spent in the window so far.
        elapsed: Duration,
        /// Time left in the window.
        remaining: Duration,
        /// Reading taken at this tick.
        current: Option<f64>,
    },
    /// The orchestrator is paused until the operator acknowledges.
    DeviceCheckPrompt {
        /// Model awaiting confirmation.
        model_id: String,
        /// Question to show the operator.
        question: String,
    },
    /// A sub-failure was detected for a model.
    SubFailure {
        /// Failing model.
        model_id: String,
        /// Detected category.
        category: FailureCategory,
    },
    /// A model run completed. Always the last message for that model.
    Done(Box<RunResult>),
    /// Unrecoverable error for a model (`model_id` set) or for the run.
    FatalError {
        /// Affected model, if the error is model-scoped.
        model_id: Option<String>,
        /// Human-readable description.
        message: String,
    },
}

/// Tag of a [`ProgressMessage`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`ProgressMessage::Status`]
    Status,
    /// [`ProgressMessage::PhaseChange`]
    PhaseChange,
    /// [`ProgressMessage::Tick`]
    Tick,
    /// [`ProgressMessage::DeviceCheckPrompt`]
    DeviceCheckPrompt,
    /// [`ProgressMessage::SubFailure`]
    SubFailure,
    /// [`ProgressMessage::Done`]
    Done,
    /// [`ProgressMessage::FatalError`]
    FatalError,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Status,
        MessageKind::PhaseChange,
        MessageKind::Tick,
        MessageKind::DeviceCheckPrompt,
        MessageKind::SubFailure,
        MessageKind::Done,
        MessageKind::FatalError,
    ];
}

impl ProgressMessage {
    /// The message tag.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Status(_) => MessageKind::Status,
            Self::PhaseChange(_) => MessageKind::PhaseChange,
            Self::Tick { .. } => MessageKind::Tick,
            Self::DeviceCheckPrompt { .. } => MessageKind::DeviceCheckPrompt,
            Self::SubFailure { .. } => MessageKind::SubFailure,
            Self::Done(_) => MessageKind::Done,
            Self::FatalError { .. } => MessageKind::FatalError,
        }
    }
}

/// One model to run, with the device it is run on.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    /// Model profile.
    pub profile: ModelProfile,
    /// IMEI of the device under test, copied into the run result.
    pub imei: Option<Imei>,
}

impl RunEntry {
    /// Entry without a device IMEI.
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            imei: None,
        }
    }

    /// Sets the device IMEI.
    pub fn with_imei(mut self, imei: Imei) -> Self {
        self.imei = Some(imei);
        self
    }

    /// Pairs profiles with IMEIs in order. No IMEIs at all is allowed;
    /// otherwise there must be exactly one per profile.
    pub fn pair(profiles: Vec<ModelProfile>, imeis: Vec<Imei>) -> Result<Vec<Self>, ConfigError> {
        if imeis.is_empty() {
            return Ok(profiles.into_iter().map(Self::new).collect());
        }
        if imeis.len() != profiles.len() {
            return Err(ConfigError::Validation(format!(
                "{} IMEI(s) given for {} model(s)",
                imeis.len(),
                profiles.len()
            )));
        }
        Ok(profiles
            .into_iter()
            .zip(imeis)
            .map(|(profile, imei)| Self::new(profile).with_imei(imei))
            .collect())
    }
}

impl From<ModelProfile> for RunEntry {
    fn from(profile: ModelProfile) -> Self {
        Self::new(profile)
    }
}

/// Commands accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Run the given entries in order.
    Start(Vec<RunEntry>),
    /// Abandon the current model and every remaining one.
    Cancel,
    /// Abandon only the current model.
    CancelCurrentOnly,
    /// Operator confirmed the device of the named model.
    DeviceCheckAck(String),
}

/// Creates the progress channel.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Creates the control channel.
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlSender { tx }, ControlReceiver { rx })
}

/// Orchestrator end of the progress channel.
#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressMessage>,
}

impl ProgressSender {
    /// Sends a message. A vanished consumer is not an error for the run.
    pub fn emit(&self, message: ProgressMessage) {
        if self.tx.send(message).is_err() {
            tracing::trace!("progress consumer gone; message dropped");
        }
    }

    /// Sends a status line.
    pub fn status(&self, text: impl Into<String>) {
        self.emit(ProgressMessage::Status(text.into()));
    }
}

/// Result of polling the progress channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A message arrived.
    Message(ProgressMessage),
    /// Nothing arrived (no message pending or the wait timed out).
    Empty,
    /// The orchestrator is gone and every message was consumed.
    Closed,
}

/// Consumer end of the progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressMessage>,
}

impl ProgressReceiver {
    /// Non-blocking poll.
    pub fn try_next(&mut self) -> Received {
        match self.rx.try_recv() {
            Ok(message) => Received::Message(message),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }

    /// Waits up to `timeout` for the next message.
    pub async fn next_within(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Received::Message(message),
            Ok(None) => Received::Closed,
            Err(_) => Received::Empty,
        }
    }

    /// Waits for the next message; `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.rx.recv().await
    }
}

/// Consumer end of the control channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ControlSender {
    /// Sends a raw command.
    pub fn send(&self, command: ControlCommand) -> Result<(), TesterError> {
        self.tx
            .send(command)
            .map_err(|_| TesterError::OrchestratorStopped)
    }

    /// Starts a run. Accepts bare profiles or [`RunEntry`]s.
    pub fn start<E: Into<RunEntry>>(&self, entries: Vec<E>) -> Result<(), TesterError> {
        self.send(ControlCommand::Start(
            entries.into_iter().map(Into::into).collect(),
        ))
    }

    /// Cancels the whole run.
    pub fn cancel(&self) -> Result<(), TesterError> {
        self.send(ControlCommand::Cancel)
    }

    /// Cancels only the model under test.
    pub fn cancel_current(&self) -> Result<(), TesterError> {
        self.send(ControlCommand::CancelCurrentOnly)
    }

    /// Acknowledges a device check prompt.
    pub fn ack_device_check(&self, model_id: impl Into<String>) -> Result<(), TesterError> {
        self.send(ControlCommand::DeviceCheckAck(model_id.into()))
    }
}

/// Orchestrator end of the control channel.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<ControlCommand>,
}

impl ControlReceiver {
    /// Non-blocking poll. `Err(Disconnected)` once every sender is gone.
    pub(crate) fn try_next(&mut self) -> Result<Option<ControlCommand>, Disconnected> {
        match self.rx.try_recv() {
            Ok(command) => Ok(Some(command)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Disconnected),
        }
    }

    /// Waits for the next command; `None` once every sender is gone.
    pub(crate) async fn recv(&mut self) -> Option<ControlCommand> {
        self.rx.recv().await
    }
}

/// Every control sender has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;
