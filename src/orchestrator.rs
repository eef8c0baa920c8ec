//! Test orchestrator actor.
//!
//! The orchestrator owns every instrument handle and runs on its own Tokio
//! task. It receives [`ControlCommand`]s, sequences each model through
//! connect, measure, evaluate and record, and reports everything it does as
//! [`ProgressMessage`]s. Nothing is shared with the consumer besides the two
//! channels.
//!
//! Per model the phases are:
//!
//! ```text
//! Connecting -> Measuring [-> AwaitingDeviceCheck -> Measuring] -> Evaluating -> Recording
//!      \              \                  \
//!       +--------------+------------------+--> Fatal -> Recording   (instrument fault)
//!                                          +--> Cancelling           (cancel)
//! ```
//!
//! The control channel is polled between operations and selected on at every
//! wait (retry backoff, onset polling, sample cadence, device check). A command
//! already sent to a supply always completes or times out before a cancel is
//! honoured.
//!
//! The instrument handle of a model is released as soon as its instrument work
//! ends, on every path, before classification and recording run.

use crate::config::{BusAddress, DeviceCheckPolicy, MeasurementConfig, ModelProfile};
use crate::criteria;
use crate::error::InstrumentError;
use crate::error_recovery::RetryPolicy;
use crate::instrument::{HandleRegistry, InstrumentHandle};
use crate::measurement::{FailureCategory, MeasurementSample, RunResult, Verdict};
use crate::messages::{
    control_channel, progress_channel, ControlCommand, ControlReceiver, ControlSender, Phase,
    ProgressMessage, ProgressReceiver, ProgressSender, RunEntry,
};
use crate::sink::ResultSink;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Stand-in deadline for waits whose end cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Why the current model stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// Abandon this model and the rest of the run.
    Cancel,
    /// Abandon this model only.
    CancelCurrent,
    /// Every control sender is gone.
    Shutdown,
}

/// Reason a model's instrument work ended without a trace to classify.
#[derive(Debug)]
enum Halt {
    Interrupted(Interrupt),
    Fault(InstrumentError),
}

impl From<Interrupt> for Halt {
    fn from(interrupt: Interrupt) -> Self {
        Halt::Interrupted(interrupt)
    }
}

/// Effect of a control command received while a run is in progress.
enum Signal {
    Continue,
    Acknowledged,
    Stop(Interrupt),
}

/// How a `Start` request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Finished,
    Cancelled,
    Shutdown,
}

/// The orchestrator actor. Create with [`Orchestrator::new`] and drive with
/// [`Orchestrator::run`], or use [`spawn`].
pub struct Orchestrator {
    registry: HandleRegistry,
    sink: Box<dyn ResultSink>,
    measurement: MeasurementConfig,
    retry: RetryPolicy,
    progress: ProgressSender,
    control: ControlReceiver,
    phase: Phase,
    dead: HashSet<BusAddress>,
}

impl Orchestrator {
    /// Creates an idle orchestrator.
    pub fn new(
        registry: HandleRegistry,
        sink: Box<dyn ResultSink>,
        measurement: MeasurementConfig,
        retry: RetryPolicy,
        progress: ProgressSender,
        control: ControlReceiver,
    ) -> Self {
        Self {
            registry,
            sink,
            measurement,
            retry,
            progress,
            control,
            phase: Phase::Idle,
            dead: HashSet::new(),
        }
    }

    /// Runs the actor event loop until every control sender is dropped.
    pub async fn run(mut self) {
        info!("Orchestrator started");

        while let Some(command) = self.control.recv().await {
            match command {
                ControlCommand::Start(entries) => {
                    if self.run_entries(entries).await == RunEnd::Shutdown {
                        break;
                    }
                }
                ControlCommand::Cancel | ControlCommand::CancelCurrentOnly => {
                    self.progress.status("No run in progress; cancel ignored");
                }
                ControlCommand::DeviceCheckAck(model_id) => {
                    self.progress.status(format!(
                        "No device check pending; acknowledgement for '{}' ignored",
                        model_id
                    ));
                }
            }
        }

        let leaked = self.registry.live_addresses();
        if !leaked.is_empty() {
            warn!(?leaked, "orchestrator stopping with live instrument handles");
        }
        info!("Orchestrator shutting down");
    }

    async fn run_entries(&mut self, entries: Vec<RunEntry>) -> RunEnd {
        if entries.is_empty() {
            self.progress.status("No models selected; nothing to run");
            return RunEnd::Finished;
        }

        self.dead.clear();
        let total = entries.len();
        info!(models = total, "Run started");

        for (index, entry) in entries.iter().enumerate() {
            let profile = &entry.profile;
            match self.poll_control() {
                Ok(()) => {}
                Err(Interrupt::CancelCurrent) => {
                    self.progress
                        .status("No model in progress; cancel-current ignored");
                }
                Err(interrupt) => {
                    if let Some(end) = self.end_for(interrupt) {
                        return end;
                    }
                }
            }

            self.progress.status(format!(
                "[{}/{}] {} at {} V on {}",
                index + 1,
                total,
                profile.model_id,
                profile.voltage,
                profile.bus_address
            ));

            if let Err(interrupt) = self.run_model(entry).await {
                if let Some(end) = self.end_for(interrupt) {
                    return end;
                }
            }
        }

        self.progress.status("Run complete");
        self.set_phase(Phase::Idle);
        info!(models = total, "Run finished");
        RunEnd::Finished
    }

    /// Maps an interrupt to the end of the run, or `None` to carry on.
    fn end_for(&mut self, interrupt: Interrupt) -> Option<RunEnd> {
        match interrupt {
            Interrupt::CancelCurrent => None,
            Interrupt::Cancel => {
                self.progress.status("Run cancelled");
                self.set_phase(Phase::Idle);
                Some(RunEnd::Cancelled)
            }
            Interrupt::Shutdown => {
                self.set_phase(Phase::Idle);
                Some(RunEnd::Shutdown)
            }
        }
    }

    async fn run_model(&mut self, entry: &RunEntry) -> Result<(), Interrupt> {
        let profile = &entry.profile;
        let started_at = Utc::now();
        let mut samples = Vec::new();

        match self.drive(profile, &mut samples).await {
            Ok(()) => {
                self.set_phase(Phase::Evaluating);
                let verdict = criteria::classify(
                    &samples,
                    &profile.thresholds,
                    self.measurement.presence_threshold,
                );
                debug!(model = %profile.model_id, %verdict, "trace classified");

                if let Some(category) = verdict.sub_failure() {
                    self.progress.emit(ProgressMessage::SubFailure {
                        model_id: profile.model_id.clone(),
                        category,
                    });
                }

                let result = build_result(entry, verdict, samples, started_at);
                self.record(result).await;
                Ok(())
            }
            Err(Halt::Fault(err)) => {
                if err.is_bus_level() {
                    self.dead.insert(profile.bus_address);
                }
                error!(model = %profile.model_id, error = %err, "model run failed");
                self.set_phase(Phase::Fatal);
                self.progress.emit(ProgressMessage::FatalError {
                    model_id: Some(profile.model_id.clone()),
                    message: format!("{}: {}", profile.model_id, err),
                });

                let verdict = Verdict::Fail(FailureCategory::InstrumentFault);
                let result = build_result(entry, verdict, samples, started_at);
                self.record(result).await;
                Ok(())
            }
            Err(Halt::Interrupted(interrupt)) => {
                self.set_phase(Phase::Cancelling);
                info!(model = %profile.model_id, ?interrupt, "model run cancelled");
                self.progress
                    .status(format!("{} cancelled", profile.model_id));

                let result = build_result(entry, Verdict::Cancelled, samples, started_at);
                self.store(&result).await;
                Err(interrupt)
            }
        }
    }

    /// Instrument phase of one model. The handle never outlives this call.
    async fn drive(
        &mut self,
        profile: &ModelProfile,
        samples: &mut Vec<MeasurementSample>,
    ) -> Result<(), Halt> {
        let address = profile.bus_address;
        self.set_phase(Phase::Connecting);

        if self.dead.contains(&address) {
            return Err(Halt::Fault(InstrumentError::Unavailable {
                address,
                reason: "unreachable earlier in this run; not reconnecting".to_string(),
            }));
        }

        let mut handle = self.connect_with_retry(address).await?;
        let outcome = self.measure(&mut handle, profile, samples).await;

        if let Err(err) = self.registry.disconnect(handle).await {
            warn!(%address, error = %err, "supply did not close cleanly");
            self.progress
                .status(format!("Supply {} did not switch off cleanly: {}", address, err));
        }
        outcome
    }

    async fn measure(
        &mut self,
        handle: &mut InstrumentHandle,
        profile: &ModelProfile,
        samples: &mut Vec<MeasurementSample>,
    ) -> Result<(), Halt> {
        self.set_voltage_with_retry(handle, profile.voltage).await?;
        self.poll_control()?;

        self.set_phase(Phase::Measuring);
        self.progress.status(format!(
            "{}: {} V applied on {}",
            profile.model_id, profile.voltage, handle.address()
        ));

        match self.measurement.device_check {
            DeviceCheckPolicy::Always => {
                let question = format!(
                    "Confirm {} is attached and ready, then acknowledge to start measuring.",
                    profile.model_id
                );
                self.await_device_check(&profile.model_id, question).await?;
            }
            DeviceCheckPolicy::OnNoCurrent => {
                if !self.await_onset(handle).await? {
                    let question = format!(
                        "No current from {} after {:?}. Check the device is attached and powered, then acknowledge.",
                        profile.model_id, self.measurement.no_current_timeout
                    );
                    self.await_device_check(&profile.model_id, question).await?;
                }
            }
            DeviceCheckPolicy::Never => {
                self.await_onset(handle).await?;
            }
        }

        self.observe(handle, samples).await
    }

    /// Polls until the device draws current. `Ok(false)` after the no-current timeout.
    async fn await_onset(&mut self, handle: &mut InstrumentHandle) -> Result<bool, Halt> {
        let deadline = deadline_after(Instant::now(), self.measurement.no_current_timeout);
        loop {
            let current = self.read_with_retry(handle).await?;
            if current > self.measurement.presence_threshold {
                debug!(address = %handle.address(), current, "current onset detected");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                info!(address = %handle.address(), "no current within timeout");
                return Ok(false);
            }
            self.pause(self.measurement.onset_poll_interval).await?;
        }
    }

    /// Samples the observation window, one tick per reading.
    async fn observe(
        &mut self,
        handle: &mut InstrumentHandle,
        samples: &mut Vec<MeasurementSample>,
    ) -> Result<(), Halt> {
        let window = self.measurement.observation_window();
        let interval = self.measurement.sample_interval;
        let start = Instant::now();
        let mut due = start;

        for _ in 0..self.measurement.sample_count {
            due = deadline_after(due, interval);
            self.pause_until(due).await?;

            let current = self.read_with_retry(handle).await?;
            let elapsed = start.elapsed();
            samples.push(MeasurementSample::new(elapsed, current));
            self.progress.emit(ProgressMessage::Tick {
                elapsed,
                remaining: window.saturating_sub(elapsed),
                current: Some(current),
            });
        }
        Ok(())
    }

    async fn await_device_check(&mut self, model_id: &str, question: String) -> Result<(), Interrupt> {
        self.set_phase(Phase::AwaitingDeviceCheck);
        self.progress.emit(ProgressMessage::DeviceCheckPrompt {
            model_id: model_id.to_string(),
            question,
        });
        info!(model = %model_id, "waiting for device check acknowledgement");

        loop {
            let Some(command) = self.control.recv().await else {
                return Err(Interrupt::Shutdown);
            };
            match self.on_command(command, Some(model_id)) {
                Signal::Acknowledged => break,
                Signal::Stop(interrupt) => return Err(interrupt),
                Signal::Continue => {}
            }
        }

        self.set_phase(Phase::Measuring);
        self.progress
            .status(format!("{}: device check acknowledged", model_id));
        Ok(())
    }

    async fn connect_with_retry(&mut self, address: BusAddress) -> Result<InstrumentHandle, Halt> {
        let mut attempt = 1;
        loop {
            match self.registry.connect(address).await {
                Ok(handle) => return Ok(handle),
                Err(err) if self.retry.should_retry(attempt) => {
                    self.report_retry("Connect", address, attempt, &err).await?;
                    attempt += 1;
                }
                Err(err) => return Err(Halt::Fault(err)),
            }
        }
    }

    async fn set_voltage_with_retry(
        &mut self,
        handle: &mut InstrumentHandle,
        volts: f64,
    ) -> Result<(), Halt> {
        let mut attempt = 1;
        loop {
            match handle.set_voltage(volts).await {
                Ok(()) => return Ok(()),
                Err(err) if self.retry.should_retry(attempt) => {
                    self.report_retry("Set voltage", handle.address(), attempt, &err)
                        .await?;
                    attempt += 1;
                }
                Err(err) => return Err(Halt::Fault(err)),
            }
        }
    }

    async fn read_with_retry(&mut self, handle: &mut InstrumentHandle) -> Result<f64, Halt> {
        let mut attempt = 1;
        loop {
            match handle.read_current().await {
                Ok(current) => return Ok(current),
                Err(err) if self.retry.should_retry(attempt) => {
                    self.report_retry("Read current", handle.address(), attempt, &err)
                        .await?;
                    attempt += 1;
                }
                Err(err) => return Err(Halt::Fault(err)),
            }
        }
    }

    /// Reports a failed attempt and waits out its backoff.
    async fn report_retry(
        &mut self,
        operation: &str,
        address: BusAddress,
        attempt: u32,
        err: &InstrumentError,
    ) -> Result<(), Interrupt> {
        let delay = self.retry.backoff(attempt);
        warn!(%address, attempt, error = %err, ?delay, "{} failed; retrying", operation);
        self.progress.status(format!(
            "{} on {} failed (attempt {}/{}): {}; retrying in {:?}",
            operation, address, attempt, self.retry.max_attempts, err, delay
        ));
        self.pause(delay).await
    }

    async fn pause(&mut self, duration: Duration) -> Result<(), Interrupt> {
        self.pause_until(deadline_after(Instant::now(), duration)).await
    }

    /// Waits until `deadline` while staying responsive to control commands.
    async fn pause_until(&mut self, deadline: Instant) -> Result<(), Interrupt> {
        loop {
            tokio::select! {
                biased;

                command = self.control.recv() => {
                    let Some(command) = command else {
                        return Err(Interrupt::Shutdown);
                    };
                    if let Signal::Stop(interrupt) = self.on_command(command, None) {
                        return Err(interrupt);
                    }
                }
                _ = sleep_until(deadline) => return Ok(()),
            }
        }
    }

    /// Applies every control command already queued.
    fn poll_control(&mut self) -> Result<(), Interrupt> {
        loop {
            match self.control.try_next() {
                Ok(Some(command)) => {
                    if let Signal::Stop(interrupt) = self.on_command(command, None) {
                        return Err(interrupt);
                    }
                }
                Ok(None) => return Ok(()),
                Err(_) => return Err(Interrupt::Shutdown),
            }
        }
    }

    fn on_command(&self, command: ControlCommand, awaiting: Option<&str>) -> Signal {
        match command {
            ControlCommand::Cancel => Signal::Stop(Interrupt::Cancel),
            ControlCommand::CancelCurrentOnly => Signal::Stop(Interrupt::CancelCurrent),
            ControlCommand::DeviceCheckAck(model_id) if awaiting == Some(model_id.as_str()) => {
                Signal::Acknowledged
            }
            ControlCommand::DeviceCheckAck(model_id) => {
                self.progress.status(format!(
                    "Acknowledgement for '{}' ignored; it is not awaiting a device check",
                    model_id
                ));
                Signal::Continue
            }
            ControlCommand::Start(_) => {
                self.progress
                    .status("Run already in progress; start request ignored");
                Signal::Continue
            }
        }
    }

    /// Recording phase: sink, then `Done` as the model's last message.
    async fn record(&mut self, result: RunResult) {
        self.set_phase(Phase::Recording);
        self.store(&result).await;
        info!(summary = %result.summary(), "model run complete");
        self.progress.emit(ProgressMessage::Done(Box::new(result)));
    }

    async fn store(&mut self, result: &RunResult) {
        if let Err(err) = self.sink.record(result).await {
            warn!(model = %result.model_id, error = %err, "result sink failed");
            self.progress.status(format!(
                "Could not record result for {}: {}",
                result.model_id, err
            ));
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        debug!(from = %self.phase, to = %phase, "phase change");
        self.phase = phase;
        self.progress.emit(ProgressMessage::PhaseChange(phase));
    }
}

/// `from + duration`, clamped instead of overflowing on absurd durations.
fn deadline_after(from: Instant, duration: Duration) -> Instant {
    from.checked_add(duration)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn build_result(
    entry: &RunEntry,
    verdict: Verdict,
    samples: Vec<MeasurementSample>,
    started_at: DateTime<Utc>,
) -> RunResult {
    let profile = &entry.profile;
    RunResult {
        run_id: Uuid::new_v4(),
        model_id: profile.model_id.clone(),
        imei: entry.imei.clone(),
        bus_address: profile.bus_address,
        voltage: profile.voltage,
        verdict,
        samples,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Handle to a spawned orchestrator task.
pub struct OrchestratorHandle {
    control: ControlSender,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Sender for control commands. Clone it for the consumer.
    pub fn control(&self) -> &ControlSender {
        &self.control
    }

    /// Drops this handle's sender and waits for the task to finish.
    ///
    /// The task only ends once every clone of the control sender is gone.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        drop(self.control);
        self.task.await
    }
}

/// Spawns an orchestrator on the current runtime.
pub fn spawn(
    registry: HandleRegistry,
    sink: Box<dyn ResultSink>,
    measurement: MeasurementConfig,
    retry: RetryPolicy,
) -> (OrchestratorHandle, ProgressReceiver) {
    let (progress_tx, progress_rx) = progress_channel();
    let (control_tx, control_rx) = control_channel();
    let orchestrator = Orchestrator::new(registry, sink, measurement, retry, progress_tx, control_rx);
    let task = tokio::spawn(orchestrator.run());
    (
        OrchestratorHandle {
            control: control_tx,
            task,
        },
        progress_rx,
    )
}
