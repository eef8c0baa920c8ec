//! Simulated power supply bus (pseudo mode).
//!
//! Synthesizes plausible current traces without touching hardware. Traces are
//! chosen per address first, then per programmed voltage, then the default
//! shape. All randomness comes from one seeded RNG so a run is reproducible.
//!
//! The bus also records every handle open/close as a [`HandleEvent`] and can
//! inject failures, which is what the orchestrator tests are built on.
//!
//! Uses `tokio::time::sleep` for latency, so tests with paused time run
//! instantly.

use super::{PowerSupplyBus, SupplyConnection};
use crate::config::BusAddress;
use crate::error::InstrumentError;
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

/// Shape of a synthesized current trace.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceShape {
    /// Same reading every time.
    Constant(f64),
    /// `mean` plus uniform noise in `[-jitter, jitter]`, clamped at zero.
    Noisy {
        /// Centre of the trace in amps.
        mean: f64,
        /// Half-width of the noise in amps.
        jitter: f64,
    },
    /// Device draws nothing.
    Silent,
    /// Readings replayed in order, repeating from the start when exhausted.
    Scripted(Vec<f64>),
}

/// Handle lifecycle event recorded by the simulated bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    /// A connection to the address was opened.
    Opened(BusAddress),
    /// A connection to the address was closed.
    Closed(BusAddress),
}

struct SimState {
    rng: StdRng,
    default_shape: TraceShape,
    by_address: HashMap<BusAddress, TraceShape>,
    by_voltage: Vec<(f64, TraceShape)>,
    silent_probability: f64,
    open_failures: HashMap<BusAddress, u32>,
    command_failures: HashMap<BusAddress, u32>,
    unreachable: HashSet<BusAddress>,
    events: Vec<HandleEvent>,
    open_now: HashMap<BusAddress, usize>,
    open_peak: HashMap<BusAddress, usize>,
}

impl SimState {
    fn shape_for(&self, address: BusAddress, volts: Option<f64>) -> TraceShape {
        if let Some(shape) = self.by_address.get(&address) {
            return shape.clone();
        }
        volts
            .and_then(|v| {
                self.by_voltage
                    .iter()
                    .find(|(target, _)| (target - v).abs() < 1e-6)
                    .map(|(_, shape)| shape.clone())
            })
            .unwrap_or_else(|| self.default_shape.clone())
    }

    fn take_failure(counter: &mut HashMap<BusAddress, u32>, address: BusAddress) -> bool {
        match counter.get_mut(&address) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Simulated GPIB bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    latency: Duration,
}

impl SimulatedBus {
    /// Creates a bus whose noise is drawn from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                default_shape: TraceShape::Noisy {
                    mean: 0.3,
                    jitter: 0.05,
                },
                by_address: HashMap::new(),
                by_voltage: Vec::new(),
                silent_probability: 0.0,
                open_failures: HashMap::new(),
                command_failures: HashMap::new(),
                unreachable: HashSet::new(),
                events: Vec::new(),
                open_now: HashMap::new(),
                open_peak: HashMap::new(),
            })),
            latency: Duration::from_millis(5),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the per-command latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Trace used when nothing more specific matches.
    pub fn with_default_trace(self, shape: TraceShape) -> Self {
        self.state().default_shape = shape;
        self
    }

    /// Trace for any connection programmed to `volts`.
    pub fn with_voltage_trace(self, volts: f64, shape: TraceShape) -> Self {
        self.state().by_voltage.push((volts, shape));
        self
    }

    /// Trace for every connection to `address`.
    pub fn with_address_trace(self, address: BusAddress, shape: TraceShape) -> Self {
        self.state().by_address.insert(address, shape);
        self
    }

    /// Chance that a new connection behaves as if no device were attached.
    pub fn with_silent_probability(self, probability: f64) -> Self {
        self.state().silent_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// The next `count` opens of `address` fail with `Unavailable`.
    pub fn fail_next_opens(&self, address: BusAddress, count: u32) {
        self.state().open_failures.insert(address, count);
    }

    /// The next `count` commands on `address` fail with `Command`.
    pub fn fail_next_commands(&self, address: BusAddress, count: u32) {
        self.state().command_failures.insert(address, count);
    }

    /// Every open of `address` fails.
    pub fn mark_unreachable(&self, address: BusAddress) {
        self.state().unreachable.insert(address);
    }

    /// Recorded open/close events in order.
    pub fn events(&self) -> Vec<HandleEvent> {
        self.state().events.clone()
    }

    /// Connections to `address` currently open.
    pub fn open_handles(&self, address: BusAddress) -> usize {
        self.state().open_now.get(&address).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously open connections ever seen on `address`.
    pub fn peak_open_handles(&self, address: BusAddress) -> usize {
        self.state().open_peak.get(&address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PowerSupplyBus for SimulatedBus {
    async fn open(&self, address: BusAddress) -> Result<Box<dyn SupplyConnection>, InstrumentError> {
        sleep(self.latency).await;

        let mut state = self.state();
        if state.unreachable.contains(&address)
            || SimState::take_failure(&mut state.open_failures, address)
        {
            return Err(InstrumentError::Unavailable {
                address,
                reason: "simulated bus: no listener at address".to_string(),
            });
        }

        let probability = state.silent_probability;
        let silent = probability > 0.0 && state.rng.gen_bool(probability);
        state.events.push(HandleEvent::Opened(address));
        let now = {
            let count = state.open_now.entry(address).or_insert(0);
            *count += 1;
            *count
        };
        let peak = state.open_peak.entry(address).or_insert(0);
        *peak = (*peak).max(now);
        trace!(%address, silent, "simulated supply opened");

        Ok(Box::new(SimulatedConnection {
            address,
            bus: self.clone(),
            volts: None,
            output_on: false,
            silent,
            cursor: 0,
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

struct SimulatedConnection {
    address: BusAddress,
    bus: SimulatedBus,
    volts: Option<f64>,
    output_on: bool,
    silent: bool,
    cursor: usize,
    closed: bool,
}

impl SimulatedConnection {
    fn check_command(&self, command: &str) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::Command {
                address: self.address,
                command: command.to_string(),
                reason: "connection closed".to_string(),
            });
        }
        if SimState::take_failure(&mut self.bus.state().command_failures, self.address) {
            return Err(InstrumentError::Command {
                address: self.address,
                command: command.to_string(),
                reason: "simulated bus: write timeout".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SupplyConnection for SimulatedConnection {
    async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError> {
        sleep(self.bus.latency).await;
        self.check_command("VOLT")?;
        self.volts = Some(volts);
        self.output_on = true;
        Ok(())
    }

    async fn read_current(&mut self) -> Result<f64, InstrumentError> {
        sleep(self.bus.latency).await;
        self.check_command("MEAS:CURR?")?;
        if !self.output_on || self.silent {
            return Ok(0.0);
        }

        let mut state = self.bus.state();
        let current = match state.shape_for(self.address, self.volts) {
            TraceShape::Constant(value) => value,
            TraceShape::Noisy { mean, jitter } => {
                let jitter = jitter.abs();
                (mean + state.rng.gen_range(-jitter..=jitter)).max(0.0)
            }
            TraceShape::Silent => 0.0,
            TraceShape::Scripted(values) => {
                let value = values
                    .get(self.cursor % values.len().max(1))
                    .copied()
                    .unwrap_or(0.0);
                self.cursor += 1;
                value
            }
        };
        Ok(current)
    }

    async fn close(&mut self) -> Result<(), InstrumentError> {
        if self.closed {
            return Ok(());
        }
        sleep(self.bus.latency).await;
        self.closed = true;
        self.output_on = false;

        let mut state = self.bus.state();
        state.events.push(HandleEvent::Closed(self.address));
        if let Some(count) = state.open_now.get_mut(&self.address) {
            *count = count.saturating_sub(1);
        }
        trace!(address = %self.address, "simulated supply closed");
        Ok(())
    }
}
