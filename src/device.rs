// src/device.rs - Serialized, retrying register I/O per PLC
//
// One transport and one async lock per configured device. The lock is held
// for a whole operation, retries and backoff included, so requests for one
// device never interleave on the wire while different devices run in
// parallel.

use crate::{
    config::DeviceConfig,
    error::{DeviceError, PlcError, Result},
    protocols::{RegisterTransport, TransportError},
    scan_plan::MAX_BIT,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[cfg(feature = "modbus-support")]
use crate::protocols::ModbusTcpTransport;

/// Largest register count one read request may carry.
pub const MAX_READ_COUNT: u16 = 125;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Connection health of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub connected: bool,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Read { address: u16, count: u16 },
    Write { address: u16, value: u16 },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Read { .. } => "read_holding_registers",
            Request::Write { .. } => "write_register",
        }
    }
}

enum Response {
    Registers(Vec<u16>),
    Written,
}

struct DeviceSlot {
    config: DeviceConfig,
    conn: Mutex<Box<dyn RegisterTransport>>,
    health: parking_lot::Mutex<DeviceHealth>,
}

impl DeviceSlot {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .config
            .backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay)
    }

    fn mark_ok(&self) {
        let mut health = self.health.lock();
        health.connected = true;
        health.last_ok_at = Some(Utc::now());
        health.last_error = None;
        health.last_error_at = None;
        health.consecutive_failures = 0;
    }

    fn mark_error(&self, err: &DeviceError) {
        let mut health = self.health.lock();
        health.connected = false;
        health.last_error = Some(err.to_string());
        health.last_error_at = Some(Utc::now());
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
    }

    fn map_transport(&self, err: TransportError) -> DeviceError {
        let device = self.config.name.clone();
        match err {
            TransportError::Exception(reason) => DeviceError::Protocol { device, reason },
            other => DeviceError::ConnectionUnavailable {
                device,
                reason: other.to_string(),
            },
        }
    }
}

/// Owner of every device connection for the process lifetime.
pub struct DeviceIoManager {
    devices: HashMap<String, DeviceSlot>,
}

impl DeviceIoManager {
    /// Build a manager with one transport per device from `factory`.
    ///
    /// Transports are created eagerly and connected lazily.
    pub fn with_transports<F>(devices: &[DeviceConfig], mut factory: F) -> Result<Self>
    where
        F: FnMut(&DeviceConfig) -> Box<dyn RegisterTransport>,
    {
        let mut slots = HashMap::with_capacity(devices.len());
        for config in devices {
            if slots.contains_key(&config.name) {
                return Err(PlcError::Config(format!(
                    "Duplicate device name: {}",
                    config.name
                )));
            }
            let slot = DeviceSlot {
                conn: Mutex::new(factory(config)),
                health: parking_lot::Mutex::new(DeviceHealth::default()),
                config: config.clone(),
            };
            slots.insert(config.name.clone(), slot);
        }

        info!("Device I/O manager initialized with {} device(s)", slots.len());
        Ok(Self { devices: slots })
    }

    /// One Modbus TCP transport per device.
    #[cfg(feature = "modbus-support")]
    pub fn connect_tcp(devices: &[DeviceConfig]) -> Result<Self> {
        Self::with_transports(devices, |d| {
            Box::new(ModbusTcpTransport::new(d.host.clone(), d.port, d.unit_id))
        })
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn health(&self, device: &str) -> Option<DeviceHealth> {
        self.devices.get(device).map(|slot| slot.health.lock().clone())
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, DeviceHealth> {
        self.devices
            .iter()
            .map(|(name, slot)| (name.clone(), slot.health.lock().clone()))
            .collect()
    }

    fn slot(&self, device: &str) -> DeviceResult<&DeviceSlot> {
        self.devices
            .get(device)
            .ok_or_else(|| DeviceError::UnknownDevice(device.to_string()))
    }

    /// Open the device's connection if needed. `false` means unreachable now.
    pub async fn ensure_connected(&self, device: &str) -> bool {
        let Ok(slot) = self.slot(device) else {
            warn!("ensure_connected called for unknown device '{}'", device);
            return false;
        };
        let mut conn = slot.conn.lock().await;
        match Self::connect_locked(slot, conn.as_mut()).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to connect to device '{}': {}", device, err);
                slot.mark_error(&err);
                false
            }
        }
    }

    /// Read `count` holding registers starting at native `address`.
    pub async fn read_block(&self, device: &str, address: u16, count: u16) -> DeviceResult<Vec<u16>> {
        check_range(address, count)?;
        let slot = self.slot(device)?;
        let mut conn = slot.conn.lock().await;
        Self::read_locked(slot, conn.as_mut(), address, count).await
    }

    pub async fn write_register(&self, device: &str, address: u16, value: u16) -> DeviceResult<()> {
        let slot = self.slot(device)?;
        let mut conn = slot.conn.lock().await;
        Self::write_locked(slot, conn.as_mut(), address, value).await
    }

    pub async fn read_register(&self, device: &str, address: u16) -> DeviceResult<u16> {
        let words = self.read_block(device, address, 1).await?;
        first_word(device, &words)
    }

    pub async fn read_bit(&self, device: &str, address: u16, bit: u8) -> DeviceResult<bool> {
        check_bit(bit)?;
        let word = self.read_register(device, address).await?;
        Ok(word & (1 << bit) != 0)
    }

    /// Set or clear one bit of a holding register, preserving the others.
    ///
    /// Read, write and optional verify-read run under one hold of the device
    /// lock. A failed read never writes. With `verify`, a read-back that
    /// disagrees fails with [`DeviceError::VerificationMismatch`] even though
    /// the write was acknowledged.
    pub async fn bit_read_modify_write(
        &self,
        device: &str,
        address: u16,
        bit: u8,
        value: u8,
        verify: bool,
    ) -> DeviceResult<()> {
        check_bit(bit)?;
        if value > 1 {
            return Err(DeviceError::InvalidArgument(format!(
                "bit value must be 0 or 1, got {}",
                value
            )));
        }

        let slot = self.slot(device)?;
        let mut conn = slot.conn.lock().await;
        let transport = conn.as_mut();

        let mask = 1u16 << bit;
        let current = first_word(device, &Self::read_locked(slot, transport, address, 1).await?)?;
        let updated = if value == 1 { current | mask } else { current & !mask };
        debug!(
            "Device '{}' register {} bit {} -> {} ({:#06x} -> {:#06x})",
            device, address, bit, value, current, updated
        );

        Self::write_locked(slot, transport, address, updated).await?;

        if !verify {
            return Ok(());
        }

        let after = first_word(device, &Self::read_locked(slot, transport, address, 1).await?)?;
        let actual = u8::from(after & mask != 0);
        if actual != value {
            let err = DeviceError::VerificationMismatch {
                device: device.to_string(),
                address,
                bit,
                expected: value,
                actual,
            };
            error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Close every connection. Waits for in-flight operations per device.
    pub async fn shutdown(&self) {
        for (name, slot) in &self.devices {
            let mut conn = slot.conn.lock().await;
            conn.close().await;
            slot.health.lock().connected = false;
            debug!("Closed connection to device '{}'", name);
        }
        info!("Device I/O manager shut down");
    }

    // ---- lock held from here on ----

    async fn read_locked(
        slot: &DeviceSlot,
        transport: &mut dyn RegisterTransport,
        address: u16,
        count: u16,
    ) -> DeviceResult<Vec<u16>> {
        match Self::execute_locked(slot, transport, Request::Read { address, count }).await? {
            Response::Registers(words) => Ok(words),
            Response::Written => Err(unexpected(slot)),
        }
    }

    async fn write_locked(
        slot: &DeviceSlot,
        transport: &mut dyn RegisterTransport,
        address: u16,
        value: u16,
    ) -> DeviceResult<()> {
        match Self::execute_locked(slot, transport, Request::Write { address, value }).await? {
            Response::Written => Ok(()),
            Response::Registers(_) => Err(unexpected(slot)),
        }
    }

    async fn connect_locked(slot: &DeviceSlot, transport: &mut dyn RegisterTransport) -> DeviceResult<()> {
        if transport.is_open() {
            return Ok(());
        }

        let name = &slot.config.name;
        let outcome = match tokio::time::timeout(slot.timeout(), transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(slot.config.timeout_ms)),
        };

        match outcome {
            Ok(()) => {
                info!(
                    "Connected to device '{}' at {}:{}",
                    name, slot.config.host, slot.config.port
                );
                slot.health.lock().connected = true;
                Ok(())
            }
            Err(err) => {
                debug!("Connect to device '{}' failed: {}", name, err);
                transport.close().await;
                Err(DeviceError::ConnectionUnavailable {
                    device: name.clone(),
                    reason: format!("connect: {}", err),
                })
            }
        }
    }

    async fn request_once(
        slot: &DeviceSlot,
        transport: &mut dyn RegisterTransport,
        request: Request,
    ) -> DeviceResult<Response> {
        let unit = slot.config.unit_id;
        let io = async {
            match request {
                Request::Read { address, count } => transport
                    .read_holding_registers(unit, address, count)
                    .await
                    .and_then(|words| {
                        if words.len() == usize::from(count) {
                            Ok(Response::Registers(words))
                        } else {
                            Err(TransportError::Exception(format!(
                                "expected {} registers, got {}",
                                count,
                                words.len()
                            )))
                        }
                    }),
                Request::Write { address, value } => transport
                    .write_register(unit, address, value)
                    .await
                    .map(|_| Response::Written),
            }
        };

        match tokio::time::timeout(slot.timeout(), io).await {
            Ok(result) => result.map_err(|e| slot.map_transport(e)),
            Err(_) => Err(slot.map_transport(TransportError::Timeout(slot.config.timeout_ms))),
        }
    }

    /// Connect, run `request`, and on failure drop the connection and retry
    /// after `min(max_backoff, backoff * 2^attempt)`.
    async fn execute_locked(
        slot: &DeviceSlot,
        transport: &mut dyn RegisterTransport,
        request: Request,
    ) -> DeviceResult<Response> {
        let name = &slot.config.name;
        let attempts = slot.config.retries.saturating_add(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            let outcome = match Self::connect_locked(slot, transport).await {
                Ok(()) => Self::request_once(slot, transport, request).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(response) => {
                    slot.mark_ok();
                    return Ok(response);
                }
                Err(err) => {
                    debug!(
                        "Device '{}' {} attempt {}/{} failed: {}",
                        name,
                        request.name(),
                        attempt + 1,
                        attempts,
                        err
                    );
                    slot.mark_error(&err);
                    transport.close().await;
                    last_err = Some(err);

                    if attempt + 1 < attempts {
                        tokio::time::sleep(slot.backoff(attempt)).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| DeviceError::ConnectionUnavailable {
            device: name.clone(),
            reason: "no attempt made".into(),
        });
        error!(
            "Device '{}' {} failed after {} attempt(s): {}",
            name,
            request.name(),
            attempts,
            err
        );
        Err(err)
    }
}

fn check_bit(bit: u8) -> DeviceResult<()> {
    if bit > MAX_BIT {
        return Err(DeviceError::InvalidArgument(format!(
            "bit must be in 0..={}, got {}",
            MAX_BIT, bit
        )));
    }
    Ok(())
}

fn check_range(address: u16, count: u16) -> DeviceResult<()> {
    if count == 0 || count > MAX_READ_COUNT {
        return Err(DeviceError::InvalidArgument(format!(
            "register count must be in 1..={}, got {}",
            MAX_READ_COUNT, count
        )));
    }
    if u32::from(address) + u32::from(count) - 1 > u32::from(u16::MAX) {
        return Err(DeviceError::InvalidArgument(format!(
            "read of {} registers at {} runs past the last register",
            count, address
        )));
    }
    Ok(())
}

fn first_word(device: &str, words: &[u16]) -> DeviceResult<u16> {
    words.first().copied().ok_or_else(|| DeviceError::Protocol {
        device: device.to_string(),
        reason: "empty register response".into(),
    })
}

fn unexpected(slot: &DeviceSlot) -> DeviceError {
    DeviceError::Protocol {
        device: slot.config.name.clone(),
        reason: "unexpected response kind".into(),
    }
}
