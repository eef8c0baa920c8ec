//! End-to-end orchestrator scenarios on the simulated bus.
//!
//! All tests run with paused Tokio time, so observation windows and retry
//! backoffs complete instantly.

use async_trait::async_trait;
use autopower::config::{
    BusAddress, DeviceCheckPolicy, MeasurementConfig, ModelProfile, Thresholds,
};
use autopower::error::SinkError;
use autopower::error_recovery::RetryPolicy;
use autopower::instrument::simulated::{HandleEvent, SimulatedBus, TraceShape};
use autopower::instrument::HandleRegistry;
use autopower::measurement::{FailureCategory, Imei, RunResult, Verdict};
use autopower::messages::{MessageKind, Phase, ProgressMessage, ProgressReceiver, RunEntry};
use autopower::orchestrator::{self, OrchestratorHandle};
use autopower::sink::{MemorySink, ResultSink};
use std::sync::Arc;
use std::time::Duration;

fn addr(n: u8) -> BusAddress {
    BusAddress::new(n).unwrap()
}

fn profile(model: &str, volts: f64, address: u8) -> ModelProfile {
    ModelProfile::new(model, volts, addr(address), Thresholds::new(0.1, 0.5)).unwrap()
}

fn measurement() -> MeasurementConfig {
    MeasurementConfig {
        sample_count: 10,
        sample_interval: Duration::from_secs(1),
        ..MeasurementConfig::default()
    }
}

fn launch(
    bus: &SimulatedBus,
    measurement: MeasurementConfig,
    sink: Box<dyn ResultSink>,
) -> (OrchestratorHandle, ProgressReceiver) {
    let registry = HandleRegistry::new(
        Arc::new(bus.clone()),
        Duration::from_secs(2),
        Duration::from_secs(2),
    );
    orchestrator::spawn(registry, sink, measurement, RetryPolicy::default())
}

/// Receives messages up to and including the next `PhaseChange(Idle)`.
async fn until_idle(rx: &mut ProgressReceiver) -> Vec<ProgressMessage> {
    let mut seen = Vec::new();
    while let Some(message) = rx.recv().await {
        let idle = message == ProgressMessage::PhaseChange(Phase::Idle);
        seen.push(message);
        if idle {
            return seen;
        }
    }
    panic!("progress channel closed before the run went idle");
}

fn done_results(seen: &[ProgressMessage]) -> Vec<&RunResult> {
    seen.iter()
        .filter_map(|m| match m {
            ProgressMessage::Done(result) => Some(result.as_ref()),
            _ => None,
        })
        .collect()
}

fn statuses(seen: &[ProgressMessage]) -> Vec<&str> {
    seen.iter()
        .filter_map(|m| match m {
            ProgressMessage::Status(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_shared_address_models_run_serially_with_sub_failure() {
    let bus = SimulatedBus::new(42)
        .with_voltage_trace(4.2, TraceShape::Noisy { mean: 0.3, jitter: 0.02 })
        .with_voltage_trace(4.0, TraceShape::Constant(0.8));
    let sink = MemorySink::new();
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(sink.clone()));

    handle
        .control()
        .start(vec![profile("F966", 4.2, 6), profile("S936", 4.0, 6)])
        .unwrap();
    let seen = until_idle(&mut rx).await;

    let position = |pred: &dyn Fn(&ProgressMessage) -> bool| seen.iter().position(pred).unwrap();
    let f966_done = position(&|m| {
        matches!(m, ProgressMessage::Done(r) if r.model_id == "F966" && r.verdict == Verdict::Pass)
    });
    let s936_sub = position(&|m| {
        matches!(m, ProgressMessage::SubFailure { model_id, category }
            if model_id == "S936" && *category == FailureCategory::SustainedOutOfBand)
    });
    let s936_done = position(&|m| {
        matches!(m, ProgressMessage::Done(r)
            if r.model_id == "S936" && r.verdict == Verdict::Fail(FailureCategory::SustainedOutOfBand))
    });
    assert!(f966_done < s936_sub);
    assert!(s936_sub < s936_done);

    assert_eq!(bus.peak_open_handles(addr(6)), 1);
    assert_eq!(
        bus.events(),
        vec![
            HandleEvent::Opened(addr(6)),
            HandleEvent::Closed(addr(6)),
            HandleEvent::Opened(addr(6)),
            HandleEvent::Closed(addr(6)),
        ]
    );
    assert_eq!(sink.results().len(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_are_reported_then_measuring_proceeds() {
    let bus = SimulatedBus::new(7).with_default_trace(TraceShape::Constant(0.3));
    bus.fail_next_opens(addr(6), 2);
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(MemorySink::new()));

    handle.control().start(vec![profile("F966", 4.2, 6)]).unwrap();
    let seen = until_idle(&mut rx).await;

    let retries: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m, ProgressMessage::Status(text) if text.contains("retrying")))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(retries.len(), 2);

    let measuring = seen
        .iter()
        .position(|m| *m == ProgressMessage::PhaseChange(Phase::Measuring))
        .unwrap();
    assert!(retries.iter().all(|&i| i < measuring));
    assert_eq!(done_results(&seen)[0].verdict, Verdict::Pass);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_device_check_releases_handle_without_done() {
    let bus = SimulatedBus::new(7).with_default_trace(TraceShape::Constant(0.3));
    let config = MeasurementConfig {
        device_check: DeviceCheckPolicy::Always,
        ..measurement()
    };
    let sink = MemorySink::new();
    let (handle, mut rx) = launch(&bus, config, Box::new(sink.clone()));
    let control = handle.control().clone();

    control.start(vec![profile("F966", 4.2, 6)]).unwrap();
    let mut seen = Vec::new();
    while let Some(message) = rx.recv().await {
        let prompt = message.kind() == MessageKind::DeviceCheckPrompt;
        seen.push(message);
        if prompt {
            break;
        }
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(bus.open_handles(addr(6)), 1);
    control.cancel().unwrap();
    seen.extend(until_idle(&mut rx).await);

    assert!(seen.iter().all(|m| m.kind() != MessageKind::Done));
    let tail: Vec<&ProgressMessage> = seen
        .iter()
        .filter(|m| m.kind() == MessageKind::PhaseChange)
        .rev()
        .take(2)
        .collect();
    assert_eq!(
        tail,
        [
            &ProgressMessage::PhaseChange(Phase::Idle),
            &ProgressMessage::PhaseChange(Phase::Cancelling),
        ]
    );
    assert_eq!(bus.open_handles(addr(6)), 0);
    assert_eq!(sink.results()[0].verdict, Verdict::Cancelled);

    // The address is free for the next run straight away.
    control.start(vec![profile("F966", 4.2, 6)]).unwrap();
    loop {
        match rx.recv().await {
            Some(ProgressMessage::DeviceCheckPrompt { model_id, .. }) => {
                control.ack_device_check(model_id).unwrap();
                break;
            }
            Some(_) => {}
            None => panic!("orchestrator stopped"),
        }
    }
    let rerun = until_idle(&mut rx).await;
    assert_eq!(done_results(&rerun)[0].verdict, Verdict::Pass);
    assert_eq!(bus.peak_open_handles(addr(6)), 1);

    drop(control);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_current_prompts_and_flat_trace_is_sub_assembly() {
    let bus = SimulatedBus::new(7).with_address_trace(addr(9), TraceShape::Silent);
    let config = MeasurementConfig {
        no_current_timeout: Duration::from_secs(3),
        ..measurement()
    };
    let (handle, mut rx) = launch(&bus, config, Box::new(MemorySink::new()));
    let control = handle.control().clone();

    control.start(vec![profile("G981", 3.8, 9)]).unwrap();
    let mut seen = Vec::new();
    loop {
        match rx.recv().await {
            Some(ProgressMessage::DeviceCheckPrompt { model_id, question }) => {
                assert!(question.contains("No current"));
                control.ack_device_check(model_id).unwrap();
                break;
            }
            Some(message) => seen.push(message),
            None => panic!("orchestrator stopped"),
        }
    }
    assert!(seen.iter().all(|m| m.kind() != MessageKind::Tick));

    let rest = until_idle(&mut rx).await;
    assert!(rest.contains(&ProgressMessage::SubFailure {
        model_id: "G981".to_string(),
        category: FailureCategory::SubAssembly,
    }));
    assert_eq!(
        done_results(&rest)[0].verdict,
        Verdict::Fail(FailureCategory::SubAssembly)
    );

    drop(control);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_every_model_gets_one_done_in_input_order() {
    let bus = SimulatedBus::new(11).with_default_trace(TraceShape::Noisy { mean: 0.3, jitter: 0.05 });
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(MemorySink::new()));

    let ids = ["M1", "M2", "M3", "M4"];
    let profiles: Vec<ModelProfile> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| profile(id, 4.0, 1 + (i % 2) as u8))
        .collect();
    handle.control().start(profiles).unwrap();
    let seen = until_idle(&mut rx).await;

    let done: Vec<&str> = done_results(&seen)
        .iter()
        .map(|r| r.model_id.as_str())
        .collect();
    assert_eq!(done, ids);
    assert_eq!(bus.peak_open_handles(addr(1)), 1);
    assert_eq!(bus.peak_open_handles(addr(2)), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_address_fails_its_remaining_models_without_reconnecting() {
    let bus = SimulatedBus::new(5).with_default_trace(TraceShape::Constant(0.3));
    bus.mark_unreachable(addr(7));
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(MemorySink::new()));

    handle
        .control()
        .start(vec![
            profile("A100", 4.2, 7),
            profile("B200", 4.2, 7),
            profile("C300", 4.2, 6),
        ])
        .unwrap();
    let seen = until_idle(&mut rx).await;

    let fatal: Vec<Option<&str>> = seen
        .iter()
        .filter_map(|m| match m {
            ProgressMessage::FatalError { model_id, .. } => Some(model_id.as_deref()),
            _ => None,
        })
        .collect();
    assert_eq!(fatal, [Some("A100"), Some("B200")]);

    let retries = statuses(&seen)
        .into_iter()
        .filter(|s| s.contains("retrying"))
        .count();
    assert_eq!(retries, 2, "only the first model on the dead address retries");

    let verdicts: Vec<(&str, Verdict)> = done_results(&seen)
        .iter()
        .map(|r| (r.model_id.as_str(), r.verdict))
        .collect();
    assert_eq!(
        verdicts,
        [
            ("A100", Verdict::Fail(FailureCategory::InstrumentFault)),
            ("B200", Verdict::Fail(FailureCategory::InstrumentFault)),
            ("C300", Verdict::Pass),
        ]
    );
    assert_eq!(bus.events(), vec![HandleEvent::Opened(addr(6)), HandleEvent::Closed(addr(6))]);

    handle.shutdown().await.unwrap();
}

/// Receives messages until `pred` matches, returning everything seen.
async fn until(
    rx: &mut ProgressReceiver,
    mut pred: impl FnMut(&ProgressMessage) -> bool,
) -> Vec<ProgressMessage> {
    let mut seen = Vec::new();
    while let Some(message) = rx.recv().await {
        let hit = pred(&message);
        seen.push(message);
        if hit {
            return seen;
        }
    }
    panic!("progress channel closed before the expected message");
}

#[tokio::test(start_paused = true)]
async fn test_read_exhaustion_on_shared_address_fails_only_that_model() {
    let bus = SimulatedBus::new(5).with_default_trace(TraceShape::Constant(0.3));
    let sink = MemorySink::new();
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(sink.clone()));

    handle
        .control()
        .start(vec![profile("A100", 4.2, 4), profile("B200", 4.2, 4)])
        .unwrap();
    let mut seen = until(&mut rx, |m| m.kind() == MessageKind::Tick).await;
    bus.fail_next_commands(addr(4), RetryPolicy::default().max_attempts);
    seen.extend(until_idle(&mut rx).await);

    let fatal: Vec<Option<&str>> = seen
        .iter()
        .filter_map(|m| match m {
            ProgressMessage::FatalError { model_id, .. } => Some(model_id.as_deref()),
            _ => None,
        })
        .collect();
    assert_eq!(fatal, [Some("A100")]);

    let verdicts: Vec<(&str, Verdict)> = done_results(&seen)
        .iter()
        .map(|r| (r.model_id.as_str(), r.verdict))
        .collect();
    assert_eq!(
        verdicts,
        [
            ("A100", Verdict::Fail(FailureCategory::InstrumentFault)),
            ("B200", Verdict::Pass),
        ]
    );
    assert_eq!(sink.results()[0].samples.len(), 1);
    assert_eq!(
        bus.events(),
        vec![
            HandleEvent::Opened(addr(4)),
            HandleEvent::Closed(addr(4)),
            HandleEvent::Opened(addr(4)),
            HandleEvent::Closed(addr(4)),
        ]
    );
    assert!(!statuses(&seen).iter().any(|s| s.contains("not reconnecting")));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_connect_backoff_ends_the_run() {
    let bus = SimulatedBus::new(5).with_default_trace(TraceShape::Constant(0.3));
    bus.fail_next_opens(addr(6), 2);
    let sink = MemorySink::new();
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(sink.clone()));
    let control = handle.control().clone();

    control
        .start(vec![profile("A100", 4.2, 6), profile("B200", 4.2, 7)])
        .unwrap();
    let mut seen = until(&mut rx, |m| {
        matches!(m, ProgressMessage::Status(text) if text.contains("retrying"))
    })
    .await;
    control.cancel().unwrap();
    seen.extend(until_idle(&mut rx).await);

    assert!(seen.iter().all(|m| m.kind() != MessageKind::Done));
    assert!(seen.iter().all(|m| m.kind() != MessageKind::Tick));
    let statuses = statuses(&seen);
    assert!(statuses.contains(&"Run cancelled"));
    assert!(!statuses.iter().any(|s| s.contains("B200")));
    assert_eq!(
        statuses.iter().filter(|s| s.contains("retrying")).count(),
        1
    );

    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].model_id, "A100");
    assert_eq!(results[0].verdict, Verdict::Cancelled);
    assert!(bus.events().is_empty());

    drop(control);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_window_releases_handle_and_skips_remaining_models() {
    let bus = SimulatedBus::new(5).with_default_trace(TraceShape::Constant(0.3));
    let sink = MemorySink::new();
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(sink.clone()));
    let control = handle.control().clone();

    control
        .start(vec![profile("A100", 4.2, 6), profile("B200", 4.2, 6)])
        .unwrap();
    let mut ticks = 0;
    let mut seen = until(&mut rx, |m| {
        if m.kind() == MessageKind::Tick {
            ticks += 1;
        }
        ticks == 3
    })
    .await;
    assert_eq!(bus.open_handles(addr(6)), 1);
    control.cancel().unwrap();
    seen.extend(until_idle(&mut rx).await);

    assert!(seen.iter().all(|m| m.kind() != MessageKind::Done));
    let phases: Vec<&ProgressMessage> = seen
        .iter()
        .filter(|m| m.kind() == MessageKind::PhaseChange)
        .rev()
        .take(2)
        .collect();
    assert_eq!(
        phases,
        [
            &ProgressMessage::PhaseChange(Phase::Idle),
            &ProgressMessage::PhaseChange(Phase::Cancelling),
        ]
    );

    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].verdict, Verdict::Cancelled);
    assert_eq!(results[0].samples.len(), 3);
    assert_eq!(bus.open_handles(addr(6)), 0);
    assert_eq!(
        bus.events(),
        vec![HandleEvent::Opened(addr(6)), HandleEvent::Closed(addr(6))]
    );

    drop(control);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_device_imei_is_carried_into_results() {
    let bus = SimulatedBus::new(5).with_default_trace(TraceShape::Constant(0.3));
    let sink = MemorySink::new();
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(sink.clone()));
    let imei = Imei::parse("351234567890123").unwrap();

    handle
        .control()
        .start(vec![
            RunEntry::new(profile("F966", 4.2, 6)).with_imei(imei.clone()),
            RunEntry::new(profile("S936", 4.0, 7)),
        ])
        .unwrap();
    let seen = until_idle(&mut rx).await;

    let done = done_results(&seen);
    assert_eq!(done[0].imei.as_ref(), Some(&imei));
    assert!(done[0].summary().contains("[351234567890123]"));
    assert_eq!(done[1].imei, None);
    assert_eq!(sink.results()[0].imei.as_ref(), Some(&imei));

    handle.shutdown().await.unwrap();
}

struct BrokenSink;

#[async_trait]
impl ResultSink for BrokenSink {
    async fn record(&mut self, _result: &RunResult) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "log directory is read-only",
        )))
    }
}

#[tokio::test(start_paused = true)]
async fn test_sink_failure_is_a_status_and_the_run_continues() {
    let bus = SimulatedBus::new(5).with_default_trace(TraceShape::Constant(0.3));
    let (handle, mut rx) = launch(&bus, measurement(), Box::new(BrokenSink));

    handle
        .control()
        .start(vec![profile("A100", 4.2, 3), profile("B200", 4.2, 4)])
        .unwrap();
    let seen = until_idle(&mut rx).await;

    let sink_errors = statuses(&seen)
        .into_iter()
        .filter(|s| s.contains("Could not record result") && s.contains("read-only"))
        .count();
    assert_eq!(sink_errors, 2);
    assert!(seen.iter().all(|m| m.kind() != MessageKind::FatalError));
    assert_eq!(done_results(&seen).len(), 2);

    handle.shutdown().await.unwrap();
}
