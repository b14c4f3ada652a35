//! RS-232 transport for `ASRL` resources.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::{scpi, ConnectionSettings, DriverError, InstrumentIo};

/// SCPI over a serial line, 8N1 with no flow control.
pub struct SerialDriver {
    resource: String,
    path: String,
    settings: ConnectionSettings,
    port: Mutex<Option<BufReader<SerialStream>>>,
}

impl std::fmt::Debug for SerialDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDriver")
            .field("resource", &self.resource)
            .field("path", &self.path)
            .field("baud_rate", &self.settings.baud_rate)
            .finish()
    }
}

impl SerialDriver {
    /// Driver for the device at `path`; the port is opened on first use.
    pub fn new(resource: impl Into<String>, path: impl Into<String>, settings: ConnectionSettings) -> Self {
        Self {
            resource: resource.into(),
            path: path.into(),
            settings,
            port: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<BufReader<SerialStream>, DriverError> {
        debug!(resource = %self.resource, path = %self.path, baud = self.settings.baud_rate, "Opening serial port");
        let port = tokio_serial::new(self.path.as_str(), self.settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DriverError::io(&self.resource, e))?;
        Ok(BufReader::new(port))
    }

    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        read_response: bool,
    ) -> Result<Option<String>, DriverError> {
        let mut slot = self.port.lock().await;
        let mut port = match slot.take() {
            Some(port) => port,
            None => self.open()?,
        };
        let result = scpi::exchange(
            &self.resource,
            &mut port,
            command,
            &self.settings,
            timeout,
            read_response,
        )
        .await;
        if result.is_ok() {
            *slot = Some(port);
        }
        result
    }
}

#[async_trait]
impl InstrumentIo for SerialDriver {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str, timeout: Duration) -> Result<(), DriverError> {
        self.run(command, timeout, false).await.map(|_| ())
    }

    async fn query(&self, command: &str, timeout: Duration) -> Result<String, DriverError> {
        self.run(command, timeout, true)
            .await?
            .ok_or_else(|| DriverError::Parse {
                resource: self.resource.clone(),
                message: "no response".to_string(),
            })
    }

    async fn disconnect(&self) {
        self.port.lock().await.take();
    }
}
