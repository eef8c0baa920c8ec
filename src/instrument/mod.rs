//! Power supply abstraction.
//!
//! The orchestrator is polymorphic over two capability traits:
//!
//! - [`PowerSupplyBus`] opens a connection to the supply at a bus address.
//! - [`SupplyConnection`] programs the voltage, reads the current and closes.
//!
//! [`HandleRegistry`] sits between the orchestrator and a bus. It hands out at
//! most one live [`InstrumentHandle`] per address and bounds every operation
//! with the configured timeouts, so a hung supply turns into an
//! [`InstrumentError`] instead of a stalled run.
//!
//! Two buses exist: [`simulated::SimulatedBus`] for pseudo mode and tests, and
//! `visa::VisaBus` (feature `instrument_visa`) for real GPIB hardware.

pub mod simulated;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use crate::config::BusAddress;
use crate::error::InstrumentError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Opens connections to power supplies.
#[async_trait]
pub trait PowerSupplyBus: Send + Sync {
    /// Opens the supply at `address`.
    ///
    /// # Errors
    /// `InstrumentError::Unavailable` when the bus cannot be opened or the
    /// address does not answer.
    async fn open(&self, address: BusAddress) -> Result<Box<dyn SupplyConnection>, InstrumentError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Live connection to one supply.
#[async_trait]
pub trait SupplyConnection: Send {
    /// Programs the output voltage and enables the output.
    async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError>;

    /// Takes one current reading in amps.
    async fn read_current(&mut self) -> Result<f64, InstrumentError>;

    /// Disables the output and releases the connection. Idempotent.
    async fn close(&mut self) -> Result<(), InstrumentError>;
}

/// Returns the GPIB bus when the VISA driver is compiled in.
#[cfg(feature = "instrument_visa")]
pub fn gpib_bus() -> Result<Arc<dyn PowerSupplyBus>, InstrumentError> {
    Ok(Arc::new(visa::VisaBus::new()))
}

/// Returns the GPIB bus when the VISA driver is compiled in.
#[cfg(not(feature = "instrument_visa"))]
pub fn gpib_bus() -> Result<Arc<dyn PowerSupplyBus>, InstrumentError> {
    Err(InstrumentError::FeatureNotEnabled("instrument_visa".to_string()))
}

/// Exclusive handle to the supply at one address.
///
/// Obtained from [`HandleRegistry::connect`] and given back with
/// [`HandleRegistry::disconnect`].
pub struct InstrumentHandle {
    address: BusAddress,
    connection: Box<dyn SupplyConnection>,
    command_timeout: Duration,
    closed: bool,
}

impl InstrumentHandle {
    /// Address this handle owns.
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// Programs the supply voltage.
    pub async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError> {
        let address = self.address;
        let fut = self.connection.set_voltage(volts);
        bounded(address, "VOLT", self.command_timeout, fut).await
    }

    /// Takes one current reading.
    pub async fn read_current(&mut self) -> Result<f64, InstrumentError> {
        let address = self.address;
        let fut = self.connection.read_current();
        bounded(address, "MEAS:CURR?", self.command_timeout, fut).await
    }

    async fn close(&mut self) -> Result<(), InstrumentError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let address = self.address;
        let fut = self.connection.close();
        bounded(address, "OUTP OFF", self.command_timeout, fut).await
    }
}

impl Drop for InstrumentHandle {
    fn drop(&mut self) {
        if !self.closed {
            warn!(address = %self.address, "instrument handle dropped without disconnect");
        }
    }
}

async fn bounded<T>(
    address: BusAddress,
    command: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, InstrumentError>>,
) -> Result<T, InstrumentError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(InstrumentError::Command {
            address,
            command: command.to_string(),
            reason: format!("no response within {:?}", limit),
        }),
    }
}

/// Address-keyed registry of live instrument handles.
pub struct HandleRegistry {
    bus: Arc<dyn PowerSupplyBus>,
    live: HashSet<BusAddress>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl HandleRegistry {
    /// Creates a registry over `bus`.
    pub fn new(
        bus: Arc<dyn PowerSupplyBus>,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            live: HashSet::new(),
            connect_timeout,
            command_timeout,
        }
    }

    /// Opens the supply at `address`.
    ///
    /// # Errors
    /// - `AddressBusy` if a handle for the address is still live
    /// - `Unavailable` if the bus fails or the address does not answer in time
    pub async fn connect(&mut self, address: BusAddress) -> Result<InstrumentHandle, InstrumentError> {
        if self.live.contains(&address) {
            return Err(InstrumentError::AddressBusy(address));
        }

        let connection = match tokio::time::timeout(self.connect_timeout, self.bus.open(address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(InstrumentError::Unavailable {
                    address,
                    reason: format!("no response within {:?}", self.connect_timeout),
                })
            }
        };

        self.live.insert(address);
        debug!(bus = self.bus.name(), %address, "instrument handle opened");
        Ok(InstrumentHandle {
            address,
            connection,
            command_timeout: self.command_timeout,
            closed: false,
        })
    }

    /// Releases a handle. The address is free again even if closing failed.
    pub async fn disconnect(&mut self, mut handle: InstrumentHandle) -> Result<(), InstrumentError> {
        let result = handle.close().await;
        self.live.remove(&handle.address);
        debug!(bus = self.bus.name(), address = %handle.address, "instrument handle released");
        result
    }

    /// Addresses with a live handle.
    pub fn live_addresses(&self) -> Vec<BusAddress> {
        let mut addresses: Vec<_> = self.live.iter().copied().collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::simulated::{HandleEvent, SimulatedBus, TraceShape};
    use super::*;

    fn registry(bus: &SimulatedBus) -> HandleRegistry {
        HandleRegistry::new(
            Arc::new(bus.clone()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_second_handle_for_address_is_refused() {
        let bus = SimulatedBus::new(1);
        let mut registry = registry(&bus);
        let address = BusAddress::new(6).unwrap();

        let handle = registry.connect(address).await.unwrap();
        assert_eq!(
            registry.connect(address).await.err(),
            Some(InstrumentError::AddressBusy(address))
        );

        registry.disconnect(handle).await.unwrap();
        assert!(registry.live_addresses().is_empty());
        let again = registry.connect(address).await.unwrap();
        registry.disconnect(again).await.unwrap();

        assert_eq!(
            bus.events(),
            vec![
                HandleEvent::Opened(address),
                HandleEvent::Closed(address),
                HandleEvent::Opened(address),
                HandleEvent::Closed(address),
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_reads_programmed_trace() {
        let bus = SimulatedBus::new(1).with_voltage_trace(4.2, TraceShape::Constant(0.3));
        let mut registry = registry(&bus);
        let mut handle = registry.connect(BusAddress::new(6).unwrap()).await.unwrap();

        handle.set_voltage(4.2).await.unwrap();
        assert_eq!(handle.read_current().await.unwrap(), 0.3);
        registry.disconnect(handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_command_times_out() {
        let bus = SimulatedBus::new(1).with_latency(Duration::from_secs(5));
        let mut registry = HandleRegistry::new(
            Arc::new(bus.clone()),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        let address = BusAddress::new(3).unwrap();
        let mut handle = registry.connect(address).await.unwrap();

        let err = handle.read_current().await.unwrap_err();
        assert!(matches!(err, InstrumentError::Command { .. }));
        registry.disconnect(handle).await.ok();
        assert!(registry.live_addresses().is_empty());
    }
}
