//! Simulated instrument.
//!
//! `MockInstrument` behaves like a small SCPI device: it answers the common
//! `*IDN?`/`*OPC?` queries, remembers the last argument written to each header
//! so `:OUTP1 ON` followed by `:OUTP1?` answers `ON`, and can be scripted with
//! canned responses, injected faults and latency. Clones share state, so a
//! test can keep a handle while the engine owns the driver.

use async_trait::async_trait;
use parking_lot::Mutex;
use sonaris_core::CommandOp;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{DriverError, InstrumentIo};

/// Failure injected into the next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// The operation times out.
    Timeout,
    /// The transport fails.
    Io,
    /// The response is not decodable (queries only; writes fail with `Io`).
    Garbled,
}

#[derive(Debug)]
struct MockState {
    idn: String,
    responses: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
    settings: HashMap<String, String>,
    faults: VecDeque<MockFault>,
    latency: Duration,
    history: Vec<(CommandOp, String)>,
    active: usize,
    max_active: usize,
}

/// Scriptable simulated instrument.
#[derive(Debug, Clone)]
pub struct MockInstrument {
    resource: String,
    state: Arc<Mutex<MockState>>,
}

impl MockInstrument {
    /// New instrument called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            resource: format!("MOCK::{name}::INSTR"),
            state: Arc::new(Mutex::new(MockState {
                idn: format!("SONARIS,MOCK-{},0,1.0", name.to_ascii_uppercase()),
                responses: HashMap::new(),
                queued: HashMap::new(),
                settings: HashMap::new(),
                faults: VecDeque::new(),
                latency: Duration::ZERO,
                history: Vec::new(),
                active: 0,
                max_active: 0,
            })),
        }
    }

    /// Set the `*IDN?` response.
    pub fn with_idn(self, idn: impl Into<String>) -> Self {
        self.state.lock().idn = idn.into();
        self
    }

    /// Delay applied to every operation.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the per-operation delay.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Always answer `command` with `response`.
    pub fn respond(&self, command: &str, response: impl Into<String>) {
        self.state
            .lock()
            .responses
            .insert(key(command), response.into());
    }

    /// Answer the next `command` with `response`; queued answers are used before sticky ones.
    pub fn respond_once(&self, command: &str, response: impl Into<String>) {
        self.state
            .lock()
            .queued
            .entry(key(command))
            .or_default()
            .push_back(response.into());
    }

    /// Fail the next operation.
    pub fn fail_next(&self, fault: MockFault) {
        self.fail_next_n(fault, 1);
    }

    /// Fail the next `n` operations.
    pub fn fail_next_n(&self, fault: MockFault, n: usize) {
        let mut state = self.state.lock();
        state.faults.extend(std::iter::repeat(fault).take(n));
    }

    /// Every operation seen so far, in order.
    pub fn history(&self) -> Vec<(CommandOp, String)> {
        self.state.lock().history.clone()
    }

    /// Texts of the write commands seen so far.
    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|(op, _)| *op == CommandOp::Write)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Highest number of operations observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.state.lock().max_active
    }

    fn begin(&self, op: CommandOp, command: &str) -> (ActiveGuard, Option<MockFault>, Duration) {
        let mut state = self.state.lock();
        state.history.push((op, command.to_string()));
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        let fault = state.faults.pop_front();
        let latency = state.latency;
        (
            ActiveGuard {
                state: Arc::clone(&self.state),
            },
            fault,
            latency,
        )
    }

    async fn delay(&self, latency: Duration, timeout: Duration) -> Result<(), DriverError> {
        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(DriverError::timeout(&self.resource, timeout));
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn answer(&self, command: &str) -> Option<String> {
        let mut state = self.state.lock();
        let k = key(command);
        if let Some(response) = state.queued.get_mut(&k).and_then(VecDeque::pop_front) {
            return Some(response);
        }
        if let Some(response) = state.responses.get(&k) {
            return Some(response.clone());
        }
        match k.as_str() {
            "*IDN?" => return Some(state.idn.clone()),
            "*OPC?" => return Some("1".to_string()),
            "*ESR?" | "*STB?" => return Some("0".to_string()),
            ":SYST:ERR?" | "SYST:ERR?" => return Some("0,\"No error\"".to_string()),
            _ => {}
        }
        k.strip_suffix('?')
            .and_then(|header| state.settings.get(header).cloned())
    }

    fn fault_error(&self, fault: MockFault, timeout: Duration, query: bool) -> DriverError {
        match fault {
            MockFault::Timeout => DriverError::timeout(&self.resource, timeout),
            MockFault::Garbled if query => DriverError::Parse {
                resource: self.resource.clone(),
                message: "response is not UTF-8".to_string(),
            },
            MockFault::Io | MockFault::Garbled => {
                DriverError::io(&self.resource, "simulated transport failure")
            }
        }
    }
}

#[async_trait]
impl InstrumentIo for MockInstrument {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str, timeout: Duration) -> Result<(), DriverError> {
        let (_active, fault, latency) = self.begin(CommandOp::Write, command);
        trace!(resource = %self.resource, command, "mock write");
        if let Some(fault) = fault {
            return Err(self.fault_error(fault, timeout, false));
        }
        self.delay(latency, timeout).await?;

        let mut parts = command.trim().splitn(2, char::is_whitespace);
        let header = parts.next().unwrap_or_default().to_ascii_uppercase();
        let argument = parts.next().unwrap_or_default().trim().to_string();
        if !header.starts_with('*') {
            self.state.lock().settings.insert(header, argument);
        }
        Ok(())
    }

    async fn query(&self, command: &str, timeout: Duration) -> Result<String, DriverError> {
        let (_active, fault, latency) = self.begin(CommandOp::Query, command);
        trace!(resource = %self.resource, command, "mock query");
        if let Some(fault) = fault {
            return Err(self.fault_error(fault, timeout, true));
        }
        self.delay(latency, timeout).await?;
        // an unknown query goes unanswered, as on a real instrument
        self.answer(command)
            .ok_or_else(|| DriverError::timeout(&self.resource, timeout))
    }
}

struct ActiveGuard {
    state: Arc<Mutex<MockState>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
    }
}

fn key(command: &str) -> String {
    command.trim().to_ascii_uppercase()
}
