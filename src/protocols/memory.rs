// src/protocols/memory.rs - In-process register bank for simulation
use super::{RegisterTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fault injection knobs for a [`RegisterBank`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// `open` fails while set
    pub refuse_connect: bool,
    /// The next N requests fail with an I/O error
    pub fail_requests: u32,
    /// Every request answers with a device exception
    pub exception: bool,
    /// Writes are acknowledged but not applied
    pub ignore_writes: bool,
    /// Added latency per request
    pub delay_ms: u64,
}

#[derive(Default)]
struct BankState {
    registers: HashMap<u16, u16>,
    faults: Faults,
    reads: u64,
    writes: u64,
    opens: u64,
}

/// Shared holding register memory. Unset registers read as 0.
#[derive(Clone, Default)]
pub struct RegisterBank {
    state: Arc<Mutex<BankState>>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn get(&self, address: u16) -> u16 {
        self.state.lock().registers.get(&address).copied().unwrap_or(0)
    }

    /// Write consecutive registers starting at `start`.
    pub fn load(&self, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    pub fn open_count(&self) -> u64 {
        self.state.lock().opens
    }

    /// Apply request faults, returning the latency to simulate.
    fn admit(&self) -> Result<Duration, TransportError> {
        let mut state = self.state.lock();
        let delay = Duration::from_millis(state.faults.delay_ms);
        if state.faults.fail_requests > 0 {
            state.faults.fail_requests -= 1;
            return Err(TransportError::Io("connection reset by peer".into()));
        }
        if state.faults.exception {
            return Err(TransportError::Exception("illegal data address".into()));
        }
        Ok(delay)
    }
}

/// [`RegisterTransport`] over a [`RegisterBank`].
pub struct MemoryTransport {
    bank: RegisterBank,
    open: bool,
}

impl MemoryTransport {
    pub fn new(bank: RegisterBank) -> Self {
        Self { bank, open: false }
    }
}

#[async_trait]
impl RegisterTransport for MemoryTransport {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.bank.state.lock();
        state.opens += 1;
        if state.faults.refuse_connect {
            return Err(TransportError::Io("connection refused".into()));
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
    }

    async fn read_holding_registers(
        &mut self,
        _unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let delay = self.bank.admit()?;
        let words = {
            let mut state = self.bank.state.lock();
            state.reads += 1;
            (0..count)
                .map(|i| {
                    let addr = address.wrapping_add(i);
                    state.registers.get(&addr).copied().unwrap_or(0)
                })
                .collect()
        };
        if delay.is_zero() {
            // Give other tasks a chance to interleave
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
        Ok(words)
    }

    async fn write_register(
        &mut self,
        _unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let delay = self.bank.admit()?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.bank.state.lock();
        state.writes += 1;
        if !state.faults.ignore_writes {
            state.registers.insert(address, value);
        }
        Ok(())
    }
}
