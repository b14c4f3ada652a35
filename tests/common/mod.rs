//! Shared helpers for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use sonaris::clock::ManualClock;
use sonaris::config::{SonarisConfig, StoreBackend};
use sonaris::driver::MockInstrument;
use sonaris::engine::Engine;
use sonaris_core::EndpointDescriptor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Fixed starting point for manual clocks.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Seconds after [`t0`].
pub fn at(seconds: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(seconds)
}

/// In-memory configuration with short timeouts.
pub fn test_config() -> SonarisConfig {
    let mut config = SonarisConfig::default();
    config.store.backend = StoreBackend::Memory;
    config.scheduler.acquire_timeout = Duration::from_secs(2);
    config.retry.max_retries = 3;
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(40);
    config.execution.command_timeout = Duration::from_millis(100);
    config.execution.job_timeout = Duration::from_secs(5);
    config
}

/// Configuration persisting jobs as JSON files under `dir`.
pub fn json_config(dir: &Path) -> SonarisConfig {
    let mut config = test_config();
    config.store.backend = StoreBackend::Json;
    config.store.path = Some(dir.to_path_buf());
    config
}

/// Engine on a manual clock with one simulated endpoint called `endpoint`.
pub fn engine_with_mock(
    config: SonarisConfig,
    clock: Arc<ManualClock>,
    endpoint: &str,
    mock: &MockInstrument,
) -> Engine {
    let engine = Engine::builder(config)
        .with_clock(clock)
        .build()
        .expect("engine builds");
    engine
        .register_endpoint_with_driver(
            EndpointDescriptor::new(endpoint, format!("MOCK::{endpoint}::INSTR")),
            mock.clone(),
        )
        .expect("endpoint registers");
    engine
}

/// Dispatch everything due and wait for the workers.
pub async fn run_due(engine: &Engine) -> usize {
    let dispatched = engine.tick().expect("tick");
    engine.wait_idle().await;
    dispatched
}
