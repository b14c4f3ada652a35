//! Driver abstraction layer.
//!
//! Every instrument is reached through the same two capabilities, `write` and
//! `query`, defined by [`InstrumentIo`]. The set of transports is closed and
//! known at compile time, so they are variants of [`Driver`] rather than
//! boxed trait objects:
//!
//! - [`TcpipDriver`]: raw SCPI over a TCP socket (`TCPIP…::INSTR` / `::SOCKET`)
//! - `SerialDriver`: RS-232 via `tokio-serial` (`ASRL…::INSTR`, feature
//!   `instrument_serial`)
//! - [`MockInstrument`]: scripted simulated instrument (`MOCK::<name>::INSTR`)
//!
//! [`DriverRegistry`] picks the variant from the resource address scheme.
//! Drivers hold only their connection handle; all scheduling and exclusivity
//! concerns live in the session manager.

pub mod mock;
pub mod registry;
pub mod scpi;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod tcpip;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sonaris_core::ErrorKind;
use std::time::Duration;
use thiserror::Error;

pub use mock::{MockFault, MockInstrument};
pub use registry::{DriverRegistry, ResourceAddress};
#[cfg(feature = "instrument_serial")]
pub use serial::SerialDriver;
pub use tcpip::TcpipDriver;

/// Errors raised by drivers.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("I/O error on {resource}: {message}")]
    Io { resource: String, message: String },

    #[error("Timed out after {timeout:?} talking to {resource}")]
    Timeout { resource: String, timeout: Duration },

    #[error("Unparsable response from {resource}: {message}")]
    Parse { resource: String, message: String },

    #[error("Invalid resource address '{0}'")]
    InvalidAddress(String),

    #[error("No driver registered for scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Resource '{0}' requires a vendor VISA library, which this build does not link")]
    VisaRequired(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DriverError {
    /// Classify for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Io { .. } => ErrorKind::Io,
            DriverError::Timeout { .. } => ErrorKind::Timeout,
            DriverError::Parse { .. } => ErrorKind::Parse,
            DriverError::InvalidAddress(_)
            | DriverError::UnsupportedScheme(_)
            | DriverError::VisaRequired(_)
            | DriverError::FeatureNotEnabled(_) => ErrorKind::ResourceUnavailable,
        }
    }

    pub(crate) fn io(resource: &str, err: impl std::fmt::Display) -> Self {
        DriverError::Io {
            resource: resource.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn timeout(resource: &str, timeout: Duration) -> Self {
        DriverError::Timeout {
            resource: resource.to_string(),
            timeout,
        }
    }
}

/// Connection parameters shared by all transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Appended to every command.
    pub write_terminator: String,
    /// Marks the end of a response.
    pub read_terminator: String,
    /// Bound on establishing the connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Serial line speed (ASRL resources only).
    pub baud_rate: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            connect_timeout: Duration::from_secs(5),
            baud_rate: 9600,
        }
    }
}

impl ConnectionSettings {
    /// Set the write terminator.
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Set the read terminator.
    pub fn with_read_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.read_terminator = terminator.into();
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// The capability surface every transport provides.
#[async_trait]
pub trait InstrumentIo: Send + Sync {
    /// Resource address this driver talks to.
    fn resource(&self) -> &str;

    /// Send `command` without reading a response.
    async fn write(&self, command: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Send `command` and read one response, terminator stripped.
    async fn query(&self, command: &str, timeout: Duration) -> Result<String, DriverError>;

    /// Drop any open connection; the next operation reconnects.
    async fn disconnect(&self) {}
}

/// A concrete instrument transport.
#[derive(Debug)]
pub enum Driver {
    /// Raw SCPI socket.
    Tcpip(TcpipDriver),
    /// RS-232 line.
    #[cfg(feature = "instrument_serial")]
    Serial(SerialDriver),
    /// Simulated instrument.
    Mock(MockInstrument),
}

impl Driver {
    /// Short transport name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Driver::Tcpip(_) => "tcpip",
            #[cfg(feature = "instrument_serial")]
            Driver::Serial(_) => "serial",
            Driver::Mock(_) => "mock",
        }
    }
}

#[async_trait]
impl InstrumentIo for Driver {
    fn resource(&self) -> &str {
        match self {
            Driver::Tcpip(d) => d.resource(),
            #[cfg(feature = "instrument_serial")]
            Driver::Serial(d) => d.resource(),
            Driver::Mock(d) => d.resource(),
        }
    }

    async fn write(&self, command: &str, timeout: Duration) -> Result<(), DriverError> {
        match self {
            Driver::Tcpip(d) => d.write(command, timeout).await,
            #[cfg(feature = "instrument_serial")]
            Driver::Serial(d) => d.write(command, timeout).await,
            Driver::Mock(d) => d.write(command, timeout).await,
        }
    }

    async fn query(&self, command: &str, timeout: Duration) -> Result<String, DriverError> {
        match self {
            Driver::Tcpip(d) => d.query(command, timeout).await,
            #[cfg(feature = "instrument_serial")]
            Driver::Serial(d) => d.query(command, timeout).await,
            Driver::Mock(d) => d.query(command, timeout).await,
        }
    }

    async fn disconnect(&self) {
        match self {
            Driver::Tcpip(d) => d.disconnect().await,
            #[cfg(feature = "instrument_serial")]
            Driver::Serial(d) => d.disconnect().await,
            Driver::Mock(d) => d.disconnect().await,
        }
    }
}

impl From<MockInstrument> for Driver {
    fn from(mock: MockInstrument) -> Self {
        Driver::Mock(mock)
    }
}

impl From<TcpipDriver> for Driver {
    fn from(driver: TcpipDriver) -> Self {
        Driver::Tcpip(driver)
    }
}
