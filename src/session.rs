//! Instrument session manager.
//!
//! Owns every registered endpoint and arbitrates exclusive access to it. A
//! [`Session`] is a lease on one endpoint held by one job; at most one lease
//! exists per endpoint at any time.
//!
//! Acquisition is split in two steps so that grant order equals dispatch
//! order even though the executing tasks are scheduled by the runtime in an
//! arbitrary order:
//!
//! 1. [`SessionManager::enqueue`] runs synchronously in the dispatcher and
//!    either grants the lease immediately or reserves a place in the
//!    endpoint's FIFO queue.
//! 2. [`PendingAcquire::wait`] waits (bounded) for the grant.
//!
//! Leases expire unless renewed with [`Session::heartbeat`]. A background
//! sweep ([`SessionManager::spawn_sweeper`]) revokes expired leases; if a
//! command was in flight on the revoked lease the instrument state is unknown
//! and the endpoint becomes `Faulted` until [`SessionManager::reset_endpoint`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sonaris_core::{EndpointDescriptor, EndpointState, EndpointStatus, ErrorKind, JobId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, DriverError, InstrumentIo};

/// Errors raised by the session manager.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Endpoint '{0}' is not registered")]
    NotFound(String),

    #[error("Endpoint '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Endpoint '{endpoint}' still busy after {timeout:?}")]
    Busy { endpoint: String, timeout: Duration },

    #[error("Endpoint '{endpoint}' is faulted: {reason}")]
    Faulted { endpoint: String, reason: String },

    #[error("Lease on endpoint '{0}' was revoked")]
    LeaseRevoked(String),

    #[error("Endpoint '{0}' is leased and cannot be removed")]
    InUse(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl SessionError {
    /// Classify for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::AlreadyRegistered(_) => ErrorKind::ValidationFailure,
            SessionError::Busy { .. } | SessionError::InUse(_) => ErrorKind::Busy,
            SessionError::Faulted { .. } | SessionError::LeaseRevoked(_) => ErrorKind::Faulted,
            SessionError::Driver(e) => e.kind(),
        }
    }
}

/// Lease accounting, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    /// Leases granted.
    pub granted: u64,
    /// Leases released by their holder.
    pub released: u64,
    /// Leases revoked by the expiry sweep.
    pub revoked: u64,
    /// Leases currently held.
    pub active: u64,
}

/// A lease revoked by the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    /// Endpoint whose lease expired.
    pub endpoint_id: String,
    /// Holder of the expired lease.
    pub holder: JobId,
    /// Whether the endpoint was faulted because a command was in flight.
    pub faulted: bool,
}

#[derive(Debug, Clone)]
struct Grant {
    lease_id: u64,
    acquired_at: DateTime<Utc>,
    driver: Arc<Driver>,
}

#[derive(Debug)]
struct Lease {
    id: u64,
    holder: JobId,
    duration: Duration,
    expires_at: Instant,
    in_flight: bool,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    holder: JobId,
    duration: Duration,
    tx: oneshot::Sender<Result<Grant, SessionError>>,
}

#[derive(Debug)]
struct Slot {
    descriptor: EndpointDescriptor,
    driver: Arc<Driver>,
    state: EndpointState,
    lease: Option<Lease>,
    waiters: VecDeque<Waiter>,
    connected_since: Option<DateTime<Utc>>,
    last_alive: Option<DateTime<Utc>>,
    fault: Option<String>,
}

impl Slot {
    fn new(descriptor: EndpointDescriptor, driver: Arc<Driver>) -> Self {
        Self {
            descriptor,
            driver,
            state: EndpointState::Disconnected,
            lease: None,
            waiters: VecDeque::new(),
            connected_since: None,
            last_alive: None,
            fault: None,
        }
    }

    fn install_lease(&mut self, id: u64, holder: JobId, duration: Duration) -> Grant {
        let now = Utc::now();
        self.lease = Some(Lease {
            id,
            holder,
            duration,
            expires_at: Instant::now() + duration,
            in_flight: false,
        });
        if self.connected_since.is_none() {
            self.connected_since = Some(now);
        }
        self.state = EndpointState::Busy;
        Grant {
            lease_id: id,
            acquired_at: now,
            driver: Arc::clone(&self.driver),
        }
    }

    fn holds(&self, lease_id: u64) -> bool {
        self.lease.as_ref().map_or(false, |l| l.id == lease_id)
    }

    fn idle_state(&self) -> EndpointState {
        if self.connected_since.is_some() {
            EndpointState::Connected
        } else {
            EndpointState::Disconnected
        }
    }

    fn enter_fault(&mut self, reason: String) {
        let endpoint = self.descriptor.id.clone();
        error!(endpoint = %endpoint, reason = %reason, "Endpoint faulted");
        self.state = EndpointState::Faulted;
        self.lease = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(SessionError::Faulted {
                endpoint: endpoint.clone(),
                reason: reason.clone(),
            }));
        }
        self.fault = Some(reason);
    }

    fn status(&self) -> EndpointStatus {
        EndpointStatus {
            descriptor: self.descriptor.clone(),
            state: self.state,
            holder: self.lease.as_ref().map(|l| l.holder),
            waiting: self.waiters.len(),
            connected_since: self.connected_since,
            last_alive: self.last_alive,
            fault: self.fault.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicU64,
    released: AtomicU64,
    revoked: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    endpoints: Mutex<HashMap<String, Slot>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Hand the idle endpoint to the first waiter still listening.
    fn grant_next(&self, slot: &mut Slot) {
        while slot.lease.is_none() {
            let Some(waiter) = slot.waiters.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            let grant = slot.install_lease(self.next_id(), waiter.holder, waiter.duration);
            if waiter.tx.send(Ok(grant)).is_ok() {
                self.counters.granted.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %slot.descriptor.id, holder = %waiter.holder, "Lease handed to next waiter");
            } else {
                slot.lease = None;
            }
        }
        if slot.lease.is_none() && slot.state != EndpointState::Faulted {
            slot.state = slot.idle_state();
        }
    }

    fn release_lease(&self, endpoint_id: &str, lease_id: u64) -> bool {
        let mut endpoints = self.endpoints.lock();
        let Some(slot) = endpoints.get_mut(endpoint_id) else {
            return false;
        };
        if !slot.holds(lease_id) {
            return false;
        }
        slot.lease = None;
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        self.grant_next(slot);
        true
    }

    fn remove_waiter(&self, endpoint_id: &str, ticket: u64) -> bool {
        let mut endpoints = self.endpoints.lock();
        let Some(slot) = endpoints.get_mut(endpoint_id) else {
            return false;
        };
        let before = slot.waiters.len();
        slot.waiters.retain(|w| w.ticket != ticket);
        before != slot.waiters.len()
    }

    fn begin_command(&self, endpoint_id: &str, lease_id: u64) -> Result<(), SessionError> {
        let mut endpoints = self.endpoints.lock();
        let slot = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| SessionError::NotFound(endpoint_id.to_string()))?;
        let live = match slot.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                let live = lease.expires_at > Instant::now();
                lease.in_flight = live;
                live
            }
            _ => return Err(SessionError::LeaseRevoked(endpoint_id.to_string())),
        };
        if live {
            return Ok(());
        }
        // expired but not yet swept; nothing in flight, so no fault
        warn!(endpoint = %endpoint_id, "Lease expired before command start");
        slot.lease = None;
        self.counters.revoked.fetch_add(1, Ordering::Relaxed);
        self.grant_next(slot);
        Err(SessionError::LeaseRevoked(endpoint_id.to_string()))
    }

    fn renew(&self, endpoint_id: &str, lease_id: u64) -> Result<(), SessionError> {
        let mut endpoints = self.endpoints.lock();
        let slot = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| SessionError::LeaseRevoked(endpoint_id.to_string()))?;
        let now = Instant::now();
        let (live, in_flight) = match slot.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                let live = lease.expires_at > now;
                if live {
                    lease.expires_at = now + lease.duration;
                }
                (live, lease.in_flight)
            }
            _ => return Err(SessionError::LeaseRevoked(endpoint_id.to_string())),
        };
        if live {
            return Ok(());
        }
        // an in-flight command is left for the sweep to fault
        if !in_flight {
            warn!(endpoint = %endpoint_id, "Lease expired before heartbeat");
            slot.lease = None;
            self.counters.revoked.fetch_add(1, Ordering::Relaxed);
            self.grant_next(slot);
        }
        Err(SessionError::LeaseRevoked(endpoint_id.to_string()))
    }

    fn end_command(&self, endpoint_id: &str, lease_id: u64, succeeded: bool) {
        let mut endpoints = self.endpoints.lock();
        if let Some(slot) = endpoints.get_mut(endpoint_id) {
            if let Some(lease) = slot.lease.as_mut().filter(|l| l.id == lease_id) {
                lease.in_flight = false;
                if succeeded {
                    slot.last_alive = Some(Utc::now());
                }
            }
        }
    }
}

/// Exclusive lease on one endpoint.
///
/// Dropping a session without calling [`Session::release`] releases it as
/// well (with a warning), so a panicking or cancelled task cannot leak the
/// endpoint.
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    endpoint_id: String,
    holder: JobId,
    lease_id: u64,
    acquired_at: DateTime<Utc>,
    driver: Arc<Driver>,
    released: bool,
}

impl Session {
    /// Endpoint this session is bound to.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Job holding the lease.
    pub fn holder(&self) -> JobId {
        self.holder
    }

    /// When the lease was granted.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Extend the lease by its full duration from now. A lease that already
    /// expired is revoked instead, even if the sweep has not reached it yet.
    pub fn heartbeat(&self) -> Result<(), SessionError> {
        self.shared.renew(&self.endpoint_id, self.lease_id)
    }

    /// Send a command without reading a response.
    pub async fn write(&self, command: &str, timeout: Duration) -> Result<(), SessionError> {
        let mut guard = self.begin()?;
        let result = match tokio::time::timeout(timeout, self.driver.write(command, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::timeout(&self.endpoint_id, timeout)),
        };
        guard.succeeded = result.is_ok();
        debug!(endpoint = %self.endpoint_id, command, ok = guard.succeeded, "write");
        Ok(result?)
    }

    /// Send a command and read its response.
    pub async fn query(&self, command: &str, timeout: Duration) -> Result<String, SessionError> {
        let mut guard = self.begin()?;
        let result = match tokio::time::timeout(timeout, self.driver.query(command, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::timeout(&self.endpoint_id, timeout)),
        };
        guard.succeeded = result.is_ok();
        debug!(endpoint = %self.endpoint_id, command, ok = guard.succeeded, "query");
        Ok(result?)
    }

    /// Give the endpoint back. Consumes the session, so it cannot be released twice.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn begin(&self) -> Result<InFlight<'_>, SessionError> {
        self.shared.begin_command(&self.endpoint_id, self.lease_id)?;
        Ok(InFlight {
            session: self,
            succeeded: false,
        })
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.shared.release_lease(&self.endpoint_id, self.lease_id) {
            debug!(endpoint = %self.endpoint_id, holder = %self.holder, "Session released");
        } else {
            debug!(endpoint = %self.endpoint_id, holder = %self.holder, "Session already revoked");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.released {
            warn!(endpoint = %self.endpoint_id, holder = %self.holder, "Session dropped without release");
            self.release_inner();
        }
    }
}

/// Marks a command in flight for the duration of one driver call.
struct InFlight<'a> {
    session: &'a Session,
    succeeded: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.session.shared.end_command(
            &self.session.endpoint_id,
            self.session.lease_id,
            self.succeeded,
        );
    }
}

enum PendingState {
    Ready(Grant),
    Waiting(oneshot::Receiver<Result<Grant, SessionError>>),
    Done,
}

/// A reserved place in an endpoint's acquisition queue.
///
/// Dropping it before [`PendingAcquire::wait`] completes gives the place (or
/// an already granted lease) back.
pub struct PendingAcquire {
    shared: Arc<Shared>,
    endpoint_id: String,
    holder: JobId,
    ticket: u64,
    state: PendingState,
}

impl std::fmt::Debug for PendingAcquire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAcquire")
            .field("endpoint_id", &self.endpoint_id)
            .field("holder", &self.holder)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PendingAcquire {
    /// True when the lease was granted at enqueue time.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Ready(_))
    }

    /// Wait up to `timeout` for the lease.
    pub async fn wait(mut self, timeout: Duration) -> Result<Session, SessionError> {
        let received = match &mut self.state {
            PendingState::Ready(_) => None,
            PendingState::Waiting(rx) => Some(tokio::time::timeout(timeout, rx).await),
            PendingState::Done => {
                return Err(SessionError::LeaseRevoked(self.endpoint_id.clone()));
            }
        };
        match received {
            None => match std::mem::replace(&mut self.state, PendingState::Done) {
                PendingState::Ready(grant) => Ok(self.session(grant)),
                _ => Err(SessionError::LeaseRevoked(self.endpoint_id.clone())),
            },
            Some(Ok(Ok(Ok(grant)))) => {
                self.state = PendingState::Done;
                Ok(self.session(grant))
            }
            Some(Ok(Ok(Err(e)))) => {
                self.state = PendingState::Done;
                Err(e)
            }
            Some(Ok(Err(_))) => {
                self.state = PendingState::Done;
                Err(SessionError::NotFound(self.endpoint_id.clone()))
            }
            // Drop gives the queue position back.
            Some(Err(_)) => Err(SessionError::Busy {
                endpoint: self.endpoint_id.clone(),
                timeout,
            }),
        }
    }

    fn session(&self, grant: Grant) -> Session {
        debug!(endpoint = %self.endpoint_id, holder = %self.holder, lease = grant.lease_id, "Session acquired");
        Session {
            shared: Arc::clone(&self.shared),
            endpoint_id: self.endpoint_id.clone(),
            holder: self.holder,
            lease_id: grant.lease_id,
            acquired_at: grant.acquired_at,
            driver: grant.driver,
            released: false,
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, PendingState::Done) {
            PendingState::Done => {}
            PendingState::Ready(grant) => {
                self.shared.release_lease(&self.endpoint_id, grant.lease_id);
            }
            PendingState::Waiting(mut rx) => {
                if !self.shared.remove_waiter(&self.endpoint_id, self.ticket) {
                    // already granted while we stopped listening
                    if let Ok(Ok(grant)) = rx.try_recv() {
                        self.shared.release_lease(&self.endpoint_id, grant.lease_id);
                    }
                }
            }
        }
    }
}

/// Registry of endpoints and their leases. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint with its driver.
    pub fn register(&self, descriptor: EndpointDescriptor, driver: Driver) -> Result<(), SessionError> {
        let mut endpoints = self.shared.endpoints.lock();
        if endpoints.contains_key(&descriptor.id) {
            return Err(SessionError::AlreadyRegistered(descriptor.id));
        }
        info!(endpoint = %descriptor.id, address = %descriptor.address, driver = driver.kind(), "Endpoint registered");
        endpoints.insert(descriptor.id.clone(), Slot::new(descriptor, Arc::new(driver)));
        Ok(())
    }

    /// Remove an idle endpoint. Queued waiters see `NotFound`.
    pub fn deregister(&self, endpoint_id: &str) -> Result<EndpointDescriptor, SessionError> {
        let mut endpoints = self.shared.endpoints.lock();
        let leased = endpoints
            .get(endpoint_id)
            .map(|slot| slot.lease.is_some())
            .ok_or_else(|| SessionError::NotFound(endpoint_id.to_string()))?;
        if leased {
            return Err(SessionError::InUse(endpoint_id.to_string()));
        }
        let slot = endpoints
            .remove(endpoint_id)
            .ok_or_else(|| SessionError::NotFound(endpoint_id.to_string()))?;
        info!(endpoint = %endpoint_id, "Endpoint removed");
        Ok(slot.descriptor)
    }

    /// Whether `endpoint_id` is registered.
    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.shared.endpoints.lock().contains_key(endpoint_id)
    }

    /// Descriptor of a registered endpoint.
    pub fn descriptor(&self, endpoint_id: &str) -> Option<EndpointDescriptor> {
        self.shared
            .endpoints
            .lock()
            .get(endpoint_id)
            .map(|slot| slot.descriptor.clone())
    }

    /// Reserve a place in the endpoint's FIFO queue (or take the lease
    /// immediately when it is idle).
    pub fn enqueue(
        &self,
        endpoint_id: &str,
        holder: JobId,
        lease_duration: Duration,
    ) -> Result<PendingAcquire, SessionError> {
        let mut endpoints = self.shared.endpoints.lock();
        let slot = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| SessionError::NotFound(endpoint_id.to_string()))?;
        if slot.state == EndpointState::Faulted {
            return Err(SessionError::Faulted {
                endpoint: endpoint_id.to_string(),
                reason: slot.fault.clone().unwrap_or_default(),
            });
        }
        let ticket = self.shared.next_id();
        let state = if slot.lease.is_none() && slot.waiters.is_empty() {
            let grant = slot.install_lease(self.shared.next_id(), holder, lease_duration);
            self.shared.counters.granted.fetch_add(1, Ordering::Relaxed);
            PendingState::Ready(grant)
        } else {
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                ticket,
                holder,
                duration: lease_duration,
                tx,
            });
            debug!(endpoint = %endpoint_id, holder = %holder, position = slot.waiters.len(), "Queued for session");
            PendingState::Waiting(rx)
        };
        Ok(PendingAcquire {
            shared: Arc::clone(&self.shared),
            endpoint_id: endpoint_id.to_string(),
            holder,
            ticket,
            state,
        })
    }

    /// Acquire a lease, waiting at most `acquire_timeout`.
    pub async fn acquire(
        &self,
        endpoint_id: &str,
        holder: JobId,
        lease_duration: Duration,
        acquire_timeout: Duration,
    ) -> Result<Session, SessionError> {
        self.enqueue(endpoint_id, holder, lease_duration)?
            .wait(acquire_timeout)
            .await
    }

    /// Release a session.
    pub fn release(&self, session: Session) {
        session.release();
    }

    /// Revoke every lease whose deadline has passed.
    pub fn sweep_expired(&self) -> Vec<Revocation> {
        let now = Instant::now();
        let mut revoked = Vec::new();
        let mut endpoints = self.shared.endpoints.lock();
        for slot in endpoints.values_mut() {
            let expired = slot
                .lease
                .as_ref()
                .filter(|lease| lease.expires_at <= now)
                .map(|lease| (lease.holder, lease.in_flight));
            let Some((holder, in_flight)) = expired else {
                continue;
            };
            self.shared.counters.revoked.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %slot.descriptor.id, holder = %holder, in_flight, "Lease expired, revoking");
            if in_flight {
                slot.enter_fault(format!(
                    "lease of job {holder} expired with a command in flight"
                ));
            } else {
                slot.lease = None;
                self.shared.grant_next(slot);
            }
            revoked.push(Revocation {
                endpoint_id: slot.descriptor.id.clone(),
                holder,
                faulted: in_flight,
            });
        }
        revoked
    }

    /// Run [`SessionManager::sweep_expired`] every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_expired();
            }
        })
    }

    /// Put an endpoint into `Faulted`, failing queued acquisitions.
    pub fn mark_faulted(&self, endpoint_id: &str, reason: impl Into<String>) -> Result<(), SessionError> {
        let mut endpoints = self.shared.endpoints.lock();
        let slot = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| SessionError::NotFound(endpoint_id.to_string()))?;
        if slot.lease.take().is_some() {
            self.shared.counters.revoked.fetch_add(1, Ordering::Relaxed);
        }
        slot.enter_fault(reason.into());
        Ok(())
    }

    /// Clear a fault and drop the driver connection.
    pub async fn reset_endpoint(&self, endpoint_id: &str) -> Result<(), SessionError> {
        let driver = {
            let mut endpoints = self.shared.endpoints.lock();
            let slot = endpoints
                .get_mut(endpoint_id)
                .ok_or_else(|| SessionError::NotFound(endpoint_id.to_string()))?;
            if slot.state != EndpointState::Faulted {
                debug!(endpoint = %endpoint_id, state = %slot.state, "Reset on healthy endpoint ignored");
                return Ok(());
            }
            slot.state = EndpointState::Disconnected;
            slot.fault = None;
            slot.connected_since = None;
            Arc::clone(&slot.driver)
        };
        driver.disconnect().await;
        info!(endpoint = %endpoint_id, "Endpoint reset");
        Ok(())
    }

    /// Status of one endpoint.
    pub fn status(&self, endpoint_id: &str) -> Option<EndpointStatus> {
        self.shared.endpoints.lock().get(endpoint_id).map(Slot::status)
    }

    /// Status of every endpoint, sorted by id.
    pub fn list(&self) -> Vec<EndpointStatus> {
        let mut all: Vec<EndpointStatus> = self.shared.endpoints.lock().values().map(Slot::status).collect();
        all.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        all
    }

    /// Lease accounting.
    pub fn stats(&self) -> SessionStats {
        let active = self
            .shared
            .endpoints
            .lock()
            .values()
            .filter(|slot| slot.lease.is_some())
            .count() as u64;
        SessionStats {
            granted: self.shared.counters.granted.load(Ordering::Relaxed),
            released: self.shared.counters.released.load(Ordering::Relaxed),
            revoked: self.shared.counters.revoked.load(Ordering::Relaxed),
            active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockFault, MockInstrument};
    use tracing_test::traced_test;

    const LEASE: Duration = Duration::from_secs(5);
    const T: Duration = Duration::from_millis(200);

    fn manager_with(name: &str) -> (SessionManager, MockInstrument) {
        let manager = SessionManager::new();
        let mock = MockInstrument::new(name);
        manager
            .register(
                EndpointDescriptor::new(name, format!("MOCK::{name}::INSTR")),
                Driver::Mock(mock.clone()),
            )
            .expect("register");
        (manager, mock)
    }

    #[tokio::test]
    async fn first_acquire_connects_and_release_frees() {
        let (manager, _mock) = manager_with("dg");
        assert_eq!(manager.status("dg").expect("status").state, EndpointState::Disconnected);

        let session = manager.acquire("dg", JobId::new(), LEASE, T).await.expect("acquire");
        let status = manager.status("dg").expect("status");
        assert_eq!(status.state, EndpointState::Busy);
        assert_eq!(status.holder, Some(session.holder()));
        assert!(status.connected_since.is_some());

        manager.release(session);
        assert_eq!(manager.status("dg").expect("status").state, EndpointState::Connected);
        assert_eq!(
            manager.stats(),
            SessionStats {
                granted: 1,
                released: 1,
                revoked: 0,
                active: 0
            }
        );
    }

    #[tokio::test]
    async fn second_holder_times_out_as_busy() {
        let (manager, _mock) = manager_with("dg");
        let first = manager.acquire("dg", JobId::new(), LEASE, T).await.expect("first");

        let err = manager
            .acquire("dg", JobId::new(), LEASE, Duration::from_millis(20))
            .await
            .expect_err("endpoint held");
        assert!(matches!(err, SessionError::Busy { .. }));
        assert_eq!(manager.status("dg").expect("status").waiting, 0, "timed out waiter removed");

        first.release();
        let stats = manager.stats();
        assert_eq!(stats.granted, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_enqueue_order() {
        let (manager, _mock) = manager_with("dg");
        let first = manager.acquire("dg", JobId::new(), LEASE, T).await.expect("first");

        let a = JobId::new();
        let b = JobId::new();
        let pending_a = manager.enqueue("dg", a, LEASE).expect("enqueue a");
        let pending_b = manager.enqueue("dg", b, LEASE).expect("enqueue b");
        assert!(!pending_a.is_ready());

        // wait on b first; it must not jump the queue
        let wait_b = tokio::spawn(pending_b.wait(Duration::from_secs(2)));
        first.release();

        let session_a = pending_a.wait(T).await.expect("a granted");
        assert_eq!(session_a.holder(), a);
        assert!(!wait_b.is_finished());
        session_a.release();

        let session_b = wait_b.await.expect("join").expect("b granted");
        assert_eq!(session_b.holder(), b);
        session_b.release();
        assert_eq!(manager.stats().active, 0);
    }

    #[tokio::test]
    async fn dropped_session_is_released() {
        let (manager, _mock) = manager_with("dg");
        {
            let _session = manager.acquire("dg", JobId::new(), LEASE, T).await.expect("acquire");
        }
        let stats = manager.stats();
        assert_eq!((stats.granted, stats.released, stats.active), (1, 1, 0));
    }

    #[tokio::test]
    async fn commands_update_last_alive() {
        let (manager, mock) = manager_with("dg");
        let session = manager.acquire("dg", JobId::new(), LEASE, T).await.expect("acquire");
        session.write(":OUTP1 ON", T).await.expect("write");
        assert_eq!(session.query(":OUTP1?", T).await.expect("query"), "ON");
        assert!(manager.status("dg").expect("status").last_alive.is_some());

        mock.fail_next(MockFault::Io);
        let err = session.query("*IDN?", T).await.expect_err("io fault");
        assert_eq!(err.kind(), ErrorKind::Io);
        session.release();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn expired_idle_lease_is_revoked_and_handed_on() {
        let (manager, _mock) = manager_with("dg");
        let stale = manager
            .acquire("dg", JobId::new(), Duration::from_secs(1), T)
            .await
            .expect("acquire");
        let next = JobId::new();
        let pending = manager.enqueue("dg", next, LEASE).expect("enqueue");

        tokio::time::advance(Duration::from_secs(2)).await;
        let revoked = manager.sweep_expired();
        assert_eq!(revoked.len(), 1);
        assert!(!revoked[0].faulted);
        assert!(logs_contain("Lease expired, revoking"));

        let session = pending.wait(T).await.expect("granted after revoke");
        assert_eq!(session.holder(), next);

        assert!(matches!(
            stale.heartbeat(),
            Err(SessionError::LeaseRevoked(_))
        ));
        assert!(matches!(
            stale.write("*RST", T).await,
            Err(SessionError::LeaseRevoked(_))
        ));
        stale.release();
        session.release();

        let stats = manager.stats();
        assert_eq!(stats.granted, stats.released + stats.revoked);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_lease() {
        let (manager, _mock) = manager_with("dg");
        let holder = JobId::new();
        let session = manager
            .acquire("dg", holder, Duration::from_secs(1), T)
            .await
            .expect("acquire");

        tokio::time::advance(Duration::from_millis(800)).await;
        session.heartbeat().expect("heartbeat on live lease");
        tokio::time::advance(Duration::from_millis(800)).await;

        assert!(manager.sweep_expired().is_empty());
        assert_eq!(manager.status("dg").expect("status").holder, Some(holder));
        session.write("*RST", T).await.expect("lease still usable");
        session.release();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_after_expiry_revokes_lease() {
        let (manager, _mock) = manager_with("dg");
        let session = manager
            .acquire("dg", JobId::new(), Duration::from_secs(1), T)
            .await
            .expect("acquire");
        let next = JobId::new();
        let pending = manager.enqueue("dg", next, LEASE).expect("enqueue");

        tokio::time::advance(Duration::from_millis(1200)).await;
        assert!(matches!(
            session.heartbeat(),
            Err(SessionError::LeaseRevoked(_))
        ));
        assert!(manager.sweep_expired().is_empty(), "already revoked");

        let granted = pending.wait(T).await.expect("handed on");
        assert_eq!(granted.holder(), next);
        session.release();
        granted.release();

        let stats = manager.stats();
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.granted, stats.released + stats.revoked);
    }

    #[tokio::test(start_paused = true)]
    async fn revoking_in_flight_lease_faults_endpoint() {
        let (manager, mock) = manager_with("dg");
        mock.set_latency(Duration::from_secs(30));
        let session = Arc::new(
            manager
                .acquire("dg", JobId::new(), Duration::from_secs(1), T)
                .await
                .expect("acquire"),
        );

        let worker = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.write(":SLOW", Duration::from_secs(60)).await })
        };
        // let the write start
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let revoked = manager.sweep_expired();
        assert_eq!(revoked.len(), 1);
        assert!(revoked[0].faulted);
        assert_eq!(manager.status("dg").expect("status").state, EndpointState::Faulted);

        let err = manager
            .enqueue("dg", JobId::new(), LEASE)
            .expect_err("faulted endpoint refuses sessions");
        assert_eq!(err.kind(), ErrorKind::Faulted);

        worker.abort();
        manager.reset_endpoint("dg").await.expect("reset");
        assert_eq!(manager.status("dg").expect("status").state, EndpointState::Disconnected);
        let session = manager.acquire("dg", JobId::new(), LEASE, T).await.expect("usable again");
        session.release();
    }

    #[tokio::test]
    async fn unknown_endpoint_is_not_found() {
        let manager = SessionManager::new();
        let err = manager
            .enqueue("nope", JobId::new(), LEASE)
            .expect_err("unregistered");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (manager, mock) = manager_with("dg");
        let err = manager
            .register(EndpointDescriptor::new("dg", "MOCK::dg::INSTR"), Driver::Mock(mock))
            .expect_err("duplicate");
        assert!(matches!(err, SessionError::AlreadyRegistered(_)));
    }
}
