// src/protocols/mod.rs - Register transport interface
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "modbus-support")]
pub mod modbus;

pub use memory::{Faults, MemoryTransport, RegisterBank};
#[cfg(feature = "modbus-support")]
pub use modbus::ModbusTcpTransport;

/// Failure reported by a transport for a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket or link failure, the connection should be dropped
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// The device answered with an exception response
    #[error("Device exception: {0}")]
    Exception(String),

    #[error("Not connected")]
    NotConnected,
}

/// Holding register access to one PLC.
///
/// Implementations hold a single connection and are driven by
/// [`crate::device::DeviceIoManager`], which owns the retry, timeout and
/// locking policy. A transport never retries on its own.
///
/// ```rust
/// use regscan::protocols::{RegisterTransport, TransportError};
/// use async_trait::async_trait;
///
/// struct Loopback {
///     open: bool,
///     registers: Vec<u16>,
/// }
///
/// #[async_trait]
/// impl RegisterTransport for Loopback {
///     fn is_open(&self) -> bool {
///         self.open
///     }
///
///     async fn open(&mut self) -> Result<(), TransportError> {
///         self.open = true;
///         Ok(())
///     }
///
///     async fn close(&mut self) {
///         self.open = false;
///     }
///
///     async fn read_holding_registers(
///         &mut self,
///         _unit: u8,
///         address: u16,
///         count: u16,
///     ) -> Result<Vec<u16>, TransportError> {
///         let start = address as usize;
///         Ok(self.registers[start..start + count as usize].to_vec())
///     }
///
///     async fn write_register(
///         &mut self,
///         _unit: u8,
///         address: u16,
///         value: u16,
///     ) -> Result<(), TransportError> {
///         self.registers[address as usize] = value;
///         Ok(())
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterTransport: Send {
    fn is_open(&self) -> bool;

    /// Establish the connection. Called again after every failure.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Drop the connection. Must be safe to call when already closed.
    async fn close(&mut self);

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;
}
