//! Instrument endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::{Command, JobId};

/// Connection state of an endpoint as seen by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    /// Registered, never successfully acquired (or reset).
    #[default]
    Disconnected,
    /// Idle and available.
    Connected,
    /// Leased to a session.
    Busy,
    /// Needs an administrative reset before it can be used again.
    Faulted,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Disconnected => "disconnected",
            EndpointState::Connected => "connected",
            EndpointState::Busy => "busy",
            EndpointState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Static description of an instrument endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Unique endpoint id used by jobs.
    pub id: String,
    /// VISA-style resource address, e.g. `TCPIP0::192.168.1.50::INSTR`.
    pub address: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Substring expected in the `*IDN?` response.
    #[serde(default)]
    pub expected_idn: Option<String>,
    /// Supported SCPI header prefixes; empty means unrestricted.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl EndpointDescriptor {
    /// New descriptor with no capability restrictions.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            name: None,
            expected_idn: None,
            capabilities: Vec::new(),
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the expected identity substring.
    pub fn with_expected_idn(mut self, idn: impl Into<String>) -> Self {
        self.expected_idn = Some(idn.into());
        self
    }

    /// Restrict the command vocabulary to the given header prefixes.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Address scheme: the leading alphabetic part of the address (`TCPIP`, `ASRL`, ...).
    pub fn scheme(&self) -> String {
        self.address
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase()
    }

    /// Whether the endpoint accepts `command`. IEEE 488.2 common commands
    /// (`*IDN?`, `*OPC?`, `*RST`, ...) are always accepted.
    pub fn supports(&self, command: &Command) -> bool {
        if self.capabilities.is_empty() {
            return true;
        }
        let header = command.header();
        if header.starts_with('*') {
            return true;
        }
        self.capabilities
            .iter()
            .any(|prefix| header.starts_with(&prefix.to_ascii_uppercase()))
    }
}

/// Runtime view of an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// Static description.
    pub descriptor: EndpointDescriptor,
    /// Connection state.
    pub state: EndpointState,
    /// Job holding the current lease.
    pub holder: Option<JobId>,
    /// Jobs waiting to acquire, in grant order.
    pub waiting: usize,
    /// First successful acquisition since registration or reset.
    pub connected_since: Option<DateTime<Utc>>,
    /// Last successful instrument exchange.
    pub last_alive: Option<DateTime<Utc>>,
    /// Fault reason while `Faulted`.
    pub fault: Option<String>,
}

impl EndpointStatus {
    /// Time since `connected_since`, measured at `now`.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.connected_since.map(|since| now - since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_leading_letters() {
        assert_eq!(EndpointDescriptor::new("a", "TCPIP0::10.0.0.2::INSTR").scheme(), "TCPIP");
        assert_eq!(EndpointDescriptor::new("b", "asrl3::INSTR").scheme(), "ASRL");
        assert_eq!(EndpointDescriptor::new("c", "MOCK::dg::INSTR").scheme(), "MOCK");
    }

    #[test]
    fn capabilities_restrict_headers() {
        let endpoint = EndpointDescriptor::new("dg", "MOCK::dg::INSTR")
            .with_capabilities([":OUTP", ":SOUR"]);
        assert!(endpoint.supports(&Command::write(":outp1 on")));
        assert!(endpoint.supports(&Command::query("*IDN?")));
        assert!(!endpoint.supports(&Command::write(":AUToscale")));

        let open = EndpointDescriptor::new("any", "MOCK::x::INSTR");
        assert!(open.supports(&Command::write(":AUToscale")));
    }
}
