//! Resource address parsing and driver selection by scheme.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::tcpip::DEFAULT_SCPI_PORT;
use super::{ConnectionSettings, Driver, DriverError, MockInstrument, TcpipDriver};

/// A parsed VISA-style resource address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// `TCPIP[n]::host::INSTR`, `TCPIP[n]::host::inst0::INSTR`, `TCPIP[n]::host::port::SOCKET`
    Tcpip {
        /// Host name or IP.
        host: String,
        /// Raw socket port.
        port: u16,
    },
    /// `ASRL<n>::INSTR` or `ASRL<device path>::INSTR`
    Serial {
        /// OS device path.
        path: String,
    },
    /// `MOCK::<name>[::INSTR]`
    Mock {
        /// Instrument name.
        name: String,
    },
    /// `USB…` / `GPIB…`: only reachable through a vendor VISA library.
    Visa {
        /// Scheme prefix.
        scheme: String,
    },
}

impl ResourceAddress {
    /// Scheme prefix used as the registry key.
    pub fn scheme(&self) -> &str {
        match self {
            ResourceAddress::Tcpip { .. } => "TCPIP",
            ResourceAddress::Serial { .. } => "ASRL",
            ResourceAddress::Mock { .. } => "MOCK",
            ResourceAddress::Visa { scheme } => scheme,
        }
    }
}

impl FromStr for ResourceAddress {
    type Err = DriverError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let invalid = || DriverError::InvalidAddress(address.to_string());
        let parts: Vec<&str> = address.trim().split("::").collect();
        let head = parts.first().copied().unwrap_or_default();
        let scheme: String = head
            .chars()
            .take_while(char::is_ascii_alphabetic)
            .collect::<String>()
            .to_ascii_uppercase();
        let board = &head[scheme.len()..];

        match scheme.as_str() {
            "TCPIP" => {
                let suffix = parts.last().map(|s| s.to_ascii_uppercase());
                match (parts.as_slice(), suffix.as_deref()) {
                    ([_, host, _], Some("INSTR")) | ([_, host, _, _], Some("INSTR"))
                        if !host.is_empty() =>
                    {
                        Ok(ResourceAddress::Tcpip {
                            host: host.to_string(),
                            port: DEFAULT_SCPI_PORT,
                        })
                    }
                    ([_, host, port, _], Some("SOCKET")) if !host.is_empty() => {
                        let port = port.parse::<u16>().map_err(|_| invalid())?;
                        Ok(ResourceAddress::Tcpip {
                            host: host.to_string(),
                            port,
                        })
                    }
                    _ => Err(invalid()),
                }
            }
            "ASRL" => {
                if board.is_empty() {
                    return Err(invalid());
                }
                let path = match board.parse::<u32>() {
                    Ok(n) if cfg!(windows) => format!("COM{n}"),
                    Ok(n) => format!("/dev/ttyS{}", n.saturating_sub(1)),
                    Err(_) => board.to_string(),
                };
                Ok(ResourceAddress::Serial { path })
            }
            "MOCK" => match parts.get(1) {
                Some(name) if !name.is_empty() => Ok(ResourceAddress::Mock {
                    name: name.to_string(),
                }),
                _ => Err(invalid()),
            },
            "USB" | "GPIB" => Ok(ResourceAddress::Visa { scheme }),
            "" => Err(invalid()),
            other => Err(DriverError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Tcpip { host, port } => write!(f, "TCPIP::{host}::{port}::SOCKET"),
            ResourceAddress::Serial { path } => write!(f, "ASRL{path}::INSTR"),
            ResourceAddress::Mock { name } => write!(f, "MOCK::{name}::INSTR"),
            ResourceAddress::Visa { scheme } => write!(f, "{scheme}::INSTR"),
        }
    }
}

/// Builds a driver for a parsed address.
pub type DriverFactory = Arc<
    dyn Fn(&str, &ResourceAddress, &ConnectionSettings) -> Result<Driver, DriverError>
        + Send
        + Sync,
>;

/// Maps address schemes to driver constructors.
#[derive(Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
    mocks: Arc<Mutex<HashMap<String, MockInstrument>>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DriverRegistry {
    /// Registry with no schemes.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            mocks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registry with the built-in TCPIP, ASRL and MOCK transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register("TCPIP", |resource, address, settings| match address {
            ResourceAddress::Tcpip { host, port } => Ok(Driver::Tcpip(TcpipDriver::new(
                resource,
                host.clone(),
                *port,
                settings.clone(),
            ))),
            _ => Err(DriverError::InvalidAddress(resource.to_string())),
        });

        registry.register("ASRL", |resource, address, settings| match address {
            #[cfg(feature = "instrument_serial")]
            ResourceAddress::Serial { path } => Ok(Driver::Serial(super::SerialDriver::new(
                resource,
                path.clone(),
                settings.clone(),
            ))),
            #[cfg(not(feature = "instrument_serial"))]
            ResourceAddress::Serial { .. } => {
                let _ = settings;
                Err(DriverError::FeatureNotEnabled("instrument_serial".to_string()))
            }
            _ => Err(DriverError::InvalidAddress(resource.to_string())),
        });

        let mocks = Arc::clone(&registry.mocks);
        registry.register("MOCK", move |resource, address, _settings| match address {
            ResourceAddress::Mock { name } => {
                let mock = mocks
                    .lock()
                    .entry(name.clone())
                    .or_insert_with(|| MockInstrument::new(name))
                    .clone();
                Ok(Driver::Mock(mock))
            }
            _ => Err(DriverError::InvalidAddress(resource.to_string())),
        });

        registry
    }

    /// Register (or replace) the constructor for `scheme`.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str, &ResourceAddress, &ConnectionSettings) -> Result<Driver, DriverError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(scheme.to_ascii_uppercase(), Arc::new(factory));
    }

    /// Pre-install the simulated instrument returned for `MOCK::<name>` addresses.
    pub fn insert_mock(&self, name: &str, mock: MockInstrument) {
        self.mocks.lock().insert(name.to_string(), mock);
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Parse `address` and build the matching driver.
    pub fn create(&self, address: &str, settings: &ConnectionSettings) -> Result<Driver, DriverError> {
        let parsed: ResourceAddress = address.parse()?;
        if let ResourceAddress::Visa { .. } = parsed {
            return Err(DriverError::VisaRequired(address.to_string()));
        }
        let factory = self
            .factories
            .get(parsed.scheme())
            .ok_or_else(|| DriverError::UnsupportedScheme(parsed.scheme().to_string()))?;
        factory(address, &parsed, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(address: &str) -> ResourceAddress {
        address.parse().expect("valid address")
    }

    #[test]
    fn parses_tcpip_forms() {
        assert_eq!(
            parse("TCPIP0::192.168.1.50::INSTR"),
            ResourceAddress::Tcpip {
                host: "192.168.1.50".into(),
                port: 5025
            }
        );
        assert_eq!(
            parse("TCPIP::dg4202.lab::inst0::INSTR"),
            ResourceAddress::Tcpip {
                host: "dg4202.lab".into(),
                port: 5025
            }
        );
        assert_eq!(
            parse("TCPIP0::10.0.0.7::5555::SOCKET"),
            ResourceAddress::Tcpip {
                host: "10.0.0.7".into(),
                port: 5555
            }
        );
        assert!("TCPIP0::10.0.0.7::notaport::SOCKET"
            .parse::<ResourceAddress>()
            .is_err());
    }

    #[test]
    fn parses_serial_and_mock() {
        assert_eq!(
            parse("ASRL/dev/ttyUSB0::INSTR"),
            ResourceAddress::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
        assert_eq!(
            parse("MOCK::dg4202::INSTR"),
            ResourceAddress::Mock {
                name: "dg4202".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_and_visa_only_schemes() {
        let registry = DriverRegistry::with_defaults();
        let settings = ConnectionSettings::default();

        assert!(matches!(
            registry.create("USB0::0x2A8D::0x039B::CN1234::INSTR", &settings),
            Err(DriverError::VisaRequired(_))
        ));
        assert!(matches!(
            registry.create("PXI0::1::INSTR", &settings),
            Err(DriverError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            registry.create("::", &settings),
            Err(DriverError::InvalidAddress(_))
        ));
    }

    #[test]
    fn creates_drivers_by_scheme() {
        let registry = DriverRegistry::with_defaults();
        let settings = ConnectionSettings::default();

        let tcp = registry
            .create("TCPIP0::127.0.0.1::INSTR", &settings)
            .expect("tcpip driver");
        assert_eq!(tcp.kind(), "tcpip");

        let mock = MockInstrument::new("scope");
        mock.respond(":TIM:SCAL?", "1e-3");
        registry.insert_mock("scope", mock.clone());
        let driver = registry
            .create("MOCK::scope::INSTR", &settings)
            .expect("mock driver");
        match driver {
            Driver::Mock(m) => assert_eq!(m.history().len(), mock.history().len()),
            other => panic!("expected mock driver, got {}", other.kind()),
        }
    }
}
