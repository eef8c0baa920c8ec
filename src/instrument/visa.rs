//! VISA bus for GPIB power supplies.
//!
//! Wraps the visa-rs crate. VISA calls are blocking, so every operation runs
//! on Tokio's blocking pool. Supplies are addressed as `GPIB0::<n>::INSTR` and
//! driven with plain SCPI:
//!
//! - `VOLT <v>` then `OUTP ON` to program and enable the output
//! - `MEAS:CURR?` for one current reading
//! - `OUTP OFF` before the session is closed

use super::{PowerSupplyBus, SupplyConnection};
use crate::config::BusAddress;
use crate::error::InstrumentError;
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use visa_rs::{flags::AccessMode, AsResourceManager, DefaultRM, Instrument};

/// Line terminator appended to every SCPI command.
const TERMINATOR: &str = "\n";

/// GPIB bus backed by the system VISA library.
pub struct VisaBus {
    open_timeout: Duration,
}

impl VisaBus {
    /// Creates a bus with a 2s VISA open timeout.
    pub fn new() -> Self {
        Self {
            open_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for VisaBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerSupplyBus for VisaBus {
    async fn open(&self, address: BusAddress) -> Result<Box<dyn SupplyConnection>, InstrumentError> {
        let resource = address.resource_string();
        let open_timeout = self.open_timeout;
        let unavailable = move |reason: String| InstrumentError::Unavailable { address, reason };

        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| format!("VISA resource manager: {}", e))?;
            let expr = CString::new(resource.clone()).map_err(|e| e.to_string())?;
            let rsc = rm
                .find_res(&expr.into())
                .map_err(|e| format!("find {}: {}", resource, e))?;
            rm.open(&rsc, AccessMode::NO_LOCK, open_timeout)
                .map_err(|e| format!("open {}: {}", resource, e))
        })
        .await
        .map_err(|e| unavailable(format!("VISA open task panicked: {}", e)))?
        .map_err(unavailable)?;

        debug!(%address, "VISA session opened");
        Ok(Box::new(VisaConnection {
            address,
            instrument: Some(Arc::new(Mutex::new(instrument))),
            output_on: false,
        }))
    }

    fn name(&self) -> &str {
        "visa"
    }
}

struct VisaConnection {
    address: BusAddress,
    instrument: Option<Arc<Mutex<Instrument>>>,
    output_on: bool,
}

impl VisaConnection {
    /// Sends one SCPI command; queries (ending in `?`) return the trimmed reply.
    async fn send(&self, command: String) -> Result<String, InstrumentError> {
        let address = self.address;
        let command_err = {
            let command = command.clone();
            move |reason: String| InstrumentError::Command {
                address,
                command: command.clone(),
                reason,
            }
        };
        let instrument = self
            .instrument
            .clone()
            .ok_or_else(|| command_err("VISA session closed".to_string()))?;

        let reply = tokio::task::spawn_blocking(move || {
            let guard = instrument.blocking_lock();
            let instr: &Instrument = &guard;
            let mut writer = instr;
            writer
                .write_all(format!("{}{}", command, TERMINATOR).as_bytes())
                .map_err(|e| format!("write failed: {}", e))?;

            if !command.trim_end().ends_with('?') {
                return Ok(String::new());
            }
            let mut line = String::new();
            BufReader::new(instr)
                .read_line(&mut line)
                .map_err(|e| format!("read failed: {}", e))?;
            Ok::<String, String>(line.trim().to_string())
        })
        .await
        .map_err(|e| command_err(format!("VISA I/O task panicked: {}", e)))?
        .map_err(&command_err)?;
        Ok(reply)
    }
}

#[async_trait]
impl SupplyConnection for VisaConnection {
    async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError> {
        self.send(format!("VOLT {}", volts)).await?;
        if !self.output_on {
            self.send("OUTP ON".to_string()).await?;
            self.output_on = true;
        }
        Ok(())
    }

    async fn read_current(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.send("MEAS:CURR?".to_string()).await?;
        reply.parse::<f64>().map_err(|e| InstrumentError::Command {
            address: self.address,
            command: "MEAS:CURR?".to_string(),
            reason: format!("unparseable reply '{}': {}", reply, e),
        })
    }

    async fn close(&mut self) -> Result<(), InstrumentError> {
        if self.instrument.is_none() {
            return Ok(());
        }
        let result = if self.output_on {
            self.send("OUTP OFF".to_string()).await.map(|_| ())
        } else {
            Ok(())
        };
        self.output_on = false;
        self.instrument = None;
        debug!(address = %self.address, "VISA session closed");
        result
    }
}
