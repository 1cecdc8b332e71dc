// src/protocols/modbus.rs - Modbus TCP register transport
use super::{RegisterTransport, TransportError};
use async_trait::async_trait;
use std::io;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::debug;

/// Modbus TCP connection to one PLC.
pub struct ModbusTcpTransport {
    host: String,
    port: u16,
    unit_id: u8,
    ctx: Option<Context>,
}

impl ModbusTcpTransport {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            ctx: None,
        }
    }

    fn context(&mut self, unit: u8) -> Result<&mut Context, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }
}

fn map_io(err: io::Error) -> TransportError {
    match err.kind() {
        // tokio-modbus reports exception responses as Other / InvalidData
        io::ErrorKind::Other | io::ErrorKind::InvalidData => {
            TransportError::Exception(err.to_string())
        }
        _ => TransportError::Io(err.to_string()),
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| TransportError::Io(format!("resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| TransportError::Io(format!("no address for {}", target)))?;

        let ctx = tcp::connect_slave(addr, Slave(self.unit_id))
            .await
            .map_err(|e| TransportError::Io(format!("connect {}: {}", target, e)))?;
        debug!("Modbus TCP session open to {}", target);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!("Closed Modbus connection to {}:{}", self.host, self.port);
        }
    }

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.context(unit)?;
        let words = ctx
            .read_holding_registers(address, count)
            .await
            .map_err(map_io)?;
        if words.len() != usize::from(count) {
            return Err(TransportError::Exception(format!(
                "expected {} registers, got {}",
                count,
                words.len()
            )));
        }
        Ok(words)
    }

    async fn write_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let ctx = self.context(unit)?;
        ctx.write_single_register(address, value)
            .await
            .map_err(map_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::DeviceIoManager;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_tcp_transport_backs_device_manager() {
        assert_send_sync::<DeviceIoManager>();
        let transport: Box<dyn RegisterTransport> =
            Box::new(ModbusTcpTransport::new("127.0.0.1", 502, 1));
        assert!(!transport.is_open());

        let manager = DeviceIoManager::connect_tcp(&[DeviceConfig::new("plc", "127.0.0.1")]).unwrap();
        assert_eq!(manager.device_names(), vec!["plc".to_string()]);
    }

    #[tokio::test]
    async fn test_close_when_not_open() {
        let mut transport = ModbusTcpTransport::new("127.0.0.1", 502, 1);
        transport.close().await;
        assert!(!transport.is_open());
        assert_eq!(
            transport.read_holding_registers(1, 0, 1).await,
            Err(TransportError::NotConnected)
        );
    }
}
