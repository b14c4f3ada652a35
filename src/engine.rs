//! The engine facade.
//!
//! [`Engine`] wires the session manager, scheduler, executor and state store
//! together and runs the dispatch loop. It owns no globals: the store and
//! clock are injected through [`EngineBuilder`], so tests can drive it with a
//! [`ManualClock`](crate::clock::ManualClock) and a
//! [`MemoryStore`](crate::store::MemoryStore).
//!
//! # Example
//!
//! ```no_run
//! use sonaris::config::SonarisConfig;
//! use sonaris::engine::Engine;
//! use sonaris_core::{Command, JobDefinition};
//!
//! # async fn run() -> sonaris::error::AppResult<()> {
//! let engine = Engine::builder(SonarisConfig::load()?).build()?;
//! let id = engine.submit_job(
//!     JobDefinition::new("output on", "dg4202").command(Command::write(":OUTP1 ON")),
//! )?;
//! engine.tick()?;
//! engine.wait_idle().await;
//! println!("{:?}", engine.get_job_status(&id)?.state);
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use sonaris_core::{
    DefinitionError, EndpointDescriptor, EndpointState, EndpointStatus, Job, JobDefinition,
    JobId,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{EndpointConfig, SonarisConfig, StoreBackend};
use crate::discovery::EndpointResolver;
use crate::driver::{ConnectionSettings, Driver, DriverRegistry};
use crate::error::{AppResult, SonarisError};
use crate::error_recovery::RetryPolicy;
use crate::executor::{ExecutionPolicy, Executor};
use crate::scheduler::{Dispatch, JobDefaults, JobFilter, RehydrateSummary, Scheduler, SchedulerError};
use crate::session::{SessionManager, SessionStats};
use crate::store::{JsonFileStore, MemoryStore, StateStore};

/// How often the dispatch loop purges expired finished jobs.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Builds an [`Engine`].
#[derive(Debug)]
pub struct EngineBuilder {
    config: SonarisConfig,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    registry: Option<DriverRegistry>,
}

impl EngineBuilder {
    /// Builder for `config`.
    pub fn new(config: SonarisConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            registry: None,
        }
    }

    /// Use `store` instead of the configured backend.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `registry` to create drivers.
    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration, register enabled endpoints and rehydrate
    /// persisted jobs.
    pub fn build(self) -> AppResult<Engine> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => match config.store.backend {
                StoreBackend::Memory => Arc::new(MemoryStore::new()),
                StoreBackend::Json => Arc::new(JsonFileStore::open(config.store_dir())?),
            },
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let registry = self.registry.unwrap_or_default();

        let sessions = SessionManager::new();
        for endpoint in config.endpoints.iter().filter(|e| e.enabled) {
            let driver = registry.create(&endpoint.address, &endpoint.connection)?;
            sessions.register(endpoint.descriptor(), driver)?;
        }

        let scheduler = Arc::new(Scheduler::new(
            store,
            Arc::clone(&clock),
            RetryPolicy::from(&config.retry),
            JobDefaults::from(&config),
        ));
        let summary = scheduler.rehydrate()?;
        let executor = Executor::new(sessions.clone(), ExecutionPolicy::from(&config));

        info!(
            endpoints = sessions.list().len(),
            requeued = summary.requeued,
            "Engine ready"
        );
        Ok(Engine {
            config: Arc::new(config),
            sessions,
            scheduler,
            executor,
            registry,
            clock,
            rehydrated: summary,
            workers: Arc::new(Mutex::new(Vec::new())),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// The scheduling engine.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<SonarisConfig>,
    sessions: SessionManager,
    scheduler: Arc<Scheduler>,
    executor: Executor,
    registry: DriverRegistry,
    clock: Arc<dyn Clock>,
    rehydrated: RehydrateSummary,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutting_down: Arc<AtomicBool>,
}

impl Engine {
    /// Start building an engine.
    pub fn builder(config: SonarisConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Configuration in use.
    pub fn config(&self) -> &SonarisConfig {
        &self.config
    }

    /// The session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The clock driving fire times.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// What startup rehydration found.
    pub fn rehydrated(&self) -> RehydrateSummary {
        self.rehydrated
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Submit a job for a registered endpoint.
    ///
    /// Every command must be within the endpoint's capability set. A faulted
    /// endpoint refuses new jobs until it is reset.
    pub fn submit_job(&self, definition: JobDefinition) -> AppResult<JobId> {
        self.ensure_running()?;
        let status = self
            .sessions
            .status(&definition.endpoint_id)
            .ok_or_else(|| SonarisError::EndpointNotFound(definition.endpoint_id.clone()))?;
        if status.state == EndpointState::Faulted {
            return Err(SonarisError::EndpointFaulted {
                endpoint: definition.endpoint_id,
                reason: status.fault.unwrap_or_default(),
            });
        }
        let descriptor = status.descriptor;
        if let Some(command) = definition.commands.iter().find(|c| !descriptor.supports(c)) {
            return Err(DefinitionError::UnsupportedCommand {
                endpoint: descriptor.id,
                command: command.text().to_string(),
            }
            .into());
        }
        self.scheduler.submit(definition).map_err(job_error)
    }

    /// Cancel a job. Unknown and finished jobs yield `NotFound`.
    pub fn cancel_job(&self, id: &JobId) -> AppResult<()> {
        self.scheduler.cancel(id).map_err(job_error)
    }

    /// Current state of a job.
    pub fn get_job_status(&self, id: &JobId) -> AppResult<Job> {
        self.scheduler.get(id).map_err(job_error)
    }

    /// Jobs matching `filter`, in submission order. The matching records are
    /// read from the store up front; the iterator does not observe later
    /// changes.
    pub fn list_jobs(&self, filter: JobFilter) -> AppResult<impl Iterator<Item = Job>> {
        Ok(self.scheduler.list(&filter)?.into_iter())
    }

    /// Delete a job that is not running.
    pub fn delete_job(&self, id: &JobId) -> AppResult<Job> {
        self.scheduler.delete(id).map_err(job_error)
    }

    /// Delete finished jobs older than `older_than`.
    pub fn purge_finished(&self, older_than: Duration) -> AppResult<usize> {
        Ok(self.scheduler.purge_finished(older_than)?)
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// Register an endpoint from its configuration.
    pub fn register_endpoint(&self, endpoint: &EndpointConfig) -> AppResult<()> {
        let driver = self.registry.create(&endpoint.address, &endpoint.connection)?;
        self.sessions.register(endpoint.descriptor(), driver)?;
        Ok(())
    }

    /// Register an endpoint with an already constructed driver.
    pub fn register_endpoint_with_driver(
        &self,
        descriptor: EndpointDescriptor,
        driver: impl Into<Driver>,
    ) -> AppResult<()> {
        self.sessions.register(descriptor, driver.into())?;
        Ok(())
    }

    /// Resolve `address` through `resolver` and register the result.
    pub async fn resolve_and_register(
        &self,
        resolver: &dyn EndpointResolver,
        address: &str,
        settings: &ConnectionSettings,
    ) -> AppResult<EndpointDescriptor> {
        let descriptor = resolver.resolve(address).await?;
        let driver = self.registry.create(&descriptor.address, settings)?;
        self.sessions.register(descriptor.clone(), driver)?;
        Ok(descriptor)
    }

    /// Remove an idle endpoint.
    pub fn deregister_endpoint(&self, endpoint_id: &str) -> AppResult<EndpointDescriptor> {
        Ok(self.sessions.deregister(endpoint_id)?)
    }

    /// Query `*IDN?` over a short-lived session and check it against the
    /// endpoint's expected identity. Returns the identity string.
    pub async fn probe_endpoint(&self, endpoint_id: &str) -> AppResult<String> {
        let descriptor = self
            .sessions
            .descriptor(endpoint_id)
            .ok_or_else(|| SonarisError::EndpointNotFound(endpoint_id.to_string()))?;
        let session = self
            .sessions
            .acquire(
                endpoint_id,
                JobId::new(),
                self.config.lease.probe,
                self.config.scheduler.acquire_timeout,
            )
            .await?;
        let idn = session
            .query("*IDN?", self.config.execution.command_timeout)
            .await;
        session.release();
        let idn = idn?;

        if let Some(expected) = descriptor.expected_idn {
            if !idn.to_lowercase().contains(&expected.to_lowercase()) {
                warn!(endpoint = %endpoint_id, idn = %idn, expected = %expected, "Identity mismatch");
                return Err(SonarisError::IdentityMismatch {
                    endpoint: endpoint_id.to_string(),
                    expected,
                    actual: idn,
                });
            }
        }
        info!(endpoint = %endpoint_id, idn = %idn, "Endpoint alive");
        Ok(idn)
    }

    /// Clear a faulted endpoint.
    pub async fn reset_endpoint(&self, endpoint_id: &str) -> AppResult<()> {
        Ok(self.sessions.reset_endpoint(endpoint_id).await?)
    }

    /// Status of every endpoint.
    pub fn endpoints(&self) -> Vec<EndpointStatus> {
        self.sessions.list()
    }

    /// Status of one endpoint.
    pub fn endpoint_status(&self, endpoint_id: &str) -> AppResult<EndpointStatus> {
        self.sessions
            .status(endpoint_id)
            .ok_or_else(|| SonarisError::EndpointNotFound(endpoint_id.to_string()))
    }

    /// Lease accounting.
    pub fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch every job due now, one worker task each. Must be called
    /// from within a tokio runtime. Returns the number of jobs dispatched.
    ///
    /// Queue places are reserved here, in dispatch order, so jobs sharing an
    /// endpoint acquire it in the order they became due.
    pub fn tick(&self) -> AppResult<usize> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let now = self.clock.now();
        let mut dispatched = 0;
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());

        while let Some(Dispatch { job, cancel }) = self.scheduler.take_due(now)? {
            let id = job.id;
            let prepared = self.executor.prepare(job);
            let executor = self.executor.clone();
            let scheduler = Arc::clone(&self.scheduler);
            workers.push(tokio::spawn(async move {
                let report = executor.run(prepared, cancel).await;
                if let Err(e) = scheduler.complete(&id, report) {
                    error!(job_id = %id, error = %e, "Failed to record job outcome");
                }
            }));
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Wait until every dispatched worker has finished.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
            if handles.is_empty() {
                return;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked");
                }
            }
        }
    }

    /// Run the dispatch loop, the lease sweeper and retention purges until
    /// `shutdown` resolves, then shut down gracefully.
    pub async fn run_until<F>(&self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let sweeper = self.sessions.spawn_sweeper(self.config.lease.sweep_interval);
        let mut ticker = tokio::time::interval(self.config.scheduler.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            tick = ?self.config.scheduler.tick_interval,
            endpoints = self.sessions.list().len(),
            "Dispatch loop started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        warn!(error = %e, "Dispatch tick failed");
                    }
                }
                _ = purge.tick() => {
                    if let Err(e) = self.purge_finished(self.config.scheduler.retention) {
                        warn!(error = %e, "Retention purge failed");
                    }
                }
            }
        }

        sweeper.abort();
        self.shutdown(self.config.execution.job_timeout).await;
        Ok(())
    }

    /// Stop dispatching, give running jobs `grace` to finish, then cancel
    /// whatever is still running.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(running = self.scheduler.running_count(), "Engine shutting down");
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            let cancelled = self.scheduler.cancel_all_running();
            warn!(cancelled, "Grace period elapsed, cancelling running jobs");
            self.wait_idle().await;
        }
        info!("Engine stopped");
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(SonarisError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

fn job_error(e: SchedulerError) -> SonarisError {
    match e {
        SchedulerError::NotFound(id) => SonarisError::JobNotFound(id),
        other => SonarisError::Scheduler(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::driver::{MockFault, MockInstrument};
    use chrono::Utc;
    use sonaris_core::{Command, ErrorKind, JobState, ResponseValidator, ScheduleRule};

    fn config() -> SonarisConfig {
        let mut config = SonarisConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.scheduler.acquire_timeout = Duration::from_millis(500);
        config.retry.base_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(50);
        config.execution.command_timeout = Duration::from_millis(100);
        config
    }

    fn engine_with(mock: &MockInstrument) -> Engine {
        let engine = Engine::builder(config())
            .with_clock(Arc::new(ManualClock::new(Utc::now())))
            .build()
            .expect("engine");
        engine
            .register_endpoint_with_driver(
                EndpointDescriptor::new("dg4202", "MOCK::dg4202::INSTR")
                    .with_expected_idn("DG4202")
                    .with_capabilities([":OUTP", ":SOUR"]),
                mock.clone(),
            )
            .expect("register");
        engine
    }

    #[tokio::test]
    async fn runs_a_submitted_job() {
        let mock = MockInstrument::new("dg4202");
        let engine = engine_with(&mock);
        let id = engine
            .submit_job(
                JobDefinition::new("toggle", "dg4202")
                    .command(Command::write(":OUTP1 ON"))
                    .command(Command::query(":OUTP1?").with_validator(ResponseValidator::exact("ON"))),
            )
            .expect("submit");

        assert_eq!(engine.tick().expect("tick"), 1);
        engine.wait_idle().await;

        let job = engine.get_job_status(&id).expect("job");
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.last_run.map(|run| run.responses), Some(vec!["ON".to_string()]));
        let stats = engine.session_stats();
        assert_eq!(stats.granted, stats.released + stats.revoked);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn rejects_unknown_endpoint_and_unsupported_commands() {
        let mock = MockInstrument::new("dg4202");
        let engine = engine_with(&mock);

        let err = engine
            .submit_job(JobDefinition::new("x", "nope").command(Command::write("*RST")))
            .expect_err("unknown endpoint");
        assert!(err.is_not_found());

        let err = engine
            .submit_job(JobDefinition::new("x", "dg4202").command(Command::write(":MEAS:VOLT?")))
            .expect_err("unsupported");
        assert!(matches!(
            err,
            SonarisError::Definition(DefinitionError::UnsupportedCommand { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_finished_job_is_not_found() {
        let mock = MockInstrument::new("dg4202");
        let engine = engine_with(&mock);
        let id = engine
            .submit_job(JobDefinition::new("toggle", "dg4202").command(Command::write(":OUTP1 ON")))
            .expect("submit");
        engine.tick().expect("tick");
        engine.wait_idle().await;

        let before = engine.get_job_status(&id).expect("job");
        let err = engine.cancel_job(&id).expect_err("finished");
        assert!(matches!(err, SonarisError::JobNotFound(_)));
        assert_eq!(engine.get_job_status(&id).expect("job"), before);
        assert!(engine.cancel_job(&JobId::new()).is_err());
    }

    #[tokio::test]
    async fn faulted_endpoint_fails_jobs_until_reset() {
        let mock = MockInstrument::new("dg4202");
        let engine = engine_with(&mock);
        let id = engine
            .submit_job(JobDefinition::new("toggle", "dg4202").command(Command::write(":OUTP1 ON")))
            .expect("submit");
        engine.sessions().mark_faulted("dg4202", "bench power cut").expect("fault");
        engine.tick().expect("tick");
        engine.wait_idle().await;
        let job = engine.get_job_status(&id).expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.map(|e| e.kind), Some(ErrorKind::ResourceUnavailable));
        assert!(mock.history().is_empty());

        engine.reset_endpoint("dg4202").await.expect("reset");
        assert_eq!(
            engine.endpoint_status("dg4202").expect("status").state,
            EndpointState::Disconnected
        );
    }

    #[tokio::test]
    async fn faulted_endpoint_refuses_new_jobs() {
        let mock = MockInstrument::new("dg4202");
        let engine = engine_with(&mock);
        engine.sessions().mark_faulted("dg4202", "bench power cut").expect("fault");

        let later = Utc::now() + chrono::Duration::hours(1);
        let err = engine
            .submit_job(
                JobDefinition::new("toggle", "dg4202")
                    .command(Command::write(":OUTP1 ON"))
                    .with_schedule(ScheduleRule::once_at(later)),
            )
            .expect_err("faulted endpoint");
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert!(err.to_string().contains("bench power cut"));
        assert_eq!(engine.list_jobs(JobFilter::all()).expect("list").count(), 0);

        engine.reset_endpoint("dg4202").await.expect("reset");
        engine
            .submit_job(JobDefinition::new("toggle", "dg4202").command(Command::write(":OUTP1 ON")))
            .expect("accepted after reset");
    }

    #[tokio::test]
    async fn probe_checks_identity() {
        let mock = MockInstrument::new("dg4202").with_idn("RIGOL TECHNOLOGIES,DG4202,DG4E1,00.01");
        let engine = engine_with(&mock);
        let idn = engine.probe_endpoint("dg4202").await.expect("alive");
        assert!(idn.contains("DG4202"));
        assert!(engine.endpoint_status("dg4202").expect("status").last_alive.is_some());

        mock.fail_next(MockFault::Timeout);
        assert!(engine.probe_endpoint("dg4202").await.is_err());

        let other = MockInstrument::new("scope");
        engine
            .register_endpoint_with_driver(
                EndpointDescriptor::new("scope", "MOCK::scope::INSTR").with_expected_idn("EDUX1002A"),
                other,
            )
            .expect("register");
        let err = engine.probe_endpoint("scope").await.expect_err("mismatch");
        assert!(matches!(err, SonarisError::IdentityMismatch { .. }));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let mock = MockInstrument::new("dg4202");
        let engine = engine_with(&mock);
        engine.shutdown(Duration::from_millis(10)).await;
        let err = engine
            .submit_job(JobDefinition::new("toggle", "dg4202").command(Command::write(":OUTP1 ON")))
            .expect_err("shutting down");
        assert!(matches!(err, SonarisError::ShuttingDown));
        assert_eq!(engine.tick().expect("tick"), 0);
    }
}
