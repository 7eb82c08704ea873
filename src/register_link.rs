use crate::error::LinkError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::prelude::*;

/// Timeout applied to connecting and to every register read.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(2);

/// Register-based transport to the current transducer.
#[async_trait]
pub trait RegisterLink: Send {
    /// Opens (or reopens) the link.
    async fn connect(&mut self) -> Result<(), LinkError>;

    /// Reads `count` holding registers starting at `start`.
    async fn read_block(&mut self, start: u16, count: u16) -> Result<Vec<u16>, LinkError>;

    /// Closes the link. Never fails; errors while closing are only logged.
    async fn close(&mut self);
}

/// Modbus TCP link to the transducer.
pub struct ModbusLink {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    connection: Option<client::Context>,
}

impl ModbusLink {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout: LINK_TIMEOUT,
            connection: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl RegisterLink for ModbusLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        self.close().await;

        let addr = self.address();
        let socket_addr = timeout(self.timeout, tokio::net::lookup_host(addr.as_str()))
            .await
            .map_err(|_| LinkError::Timeout(self.timeout))?
            .map_err(|_| LinkError::Resolve(addr.clone()))?
            .next()
            .ok_or_else(|| LinkError::Resolve(addr.clone()))?;

        tracing::debug!("Connecting to {addr} (unit {})", self.unit_id);
        let connection = timeout(self.timeout, tcp::connect_slave(socket_addr, Slave(self.unit_id)))
            .await
            .map_err(|_| LinkError::Timeout(self.timeout))?
            .map_err(|source| LinkError::Connect { addr, source })?;

        self.connection = Some(connection);
        Ok(())
    }

    async fn read_block(&mut self, start: u16, count: u16) -> Result<Vec<u16>, LinkError> {
        let connection = self.connection.as_mut().ok_or(LinkError::NotConnected)?;

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        match timeout(self.timeout, connection.read_holding_registers(start, count)).await {
            Err(_) => Err(LinkError::Timeout(self.timeout)),
            Ok(Err(transport)) => Err(LinkError::Transport(format!("{transport:?}"))),
            Ok(Ok(Err(exception))) => Err(LinkError::Exception(format!("{exception:?}"))),
            Ok(Ok(Ok(registers))) => Ok(registers),
        }
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.disconnect().await {
                tracing::debug!("Error while closing link to {}: {e:?}", self.address());
            }
        }
    }
}
