//! Instrument task scheduling and orchestration engine.
//!
//! sonaris runs user-defined jobs (ordered SCPI command sequences with response
//! validators) against lab instruments on one-shot or interval schedules:
//!
//! - [`session`]: exclusive, leased access to each endpoint with a FIFO wait queue
//! - [`driver`]: TCP/IP socket, serial and simulated transports behind one trait
//! - [`scheduler`]: earliest-deadline-first queue and the job state machine
//! - [`executor`]: runs a job's commands with retries and cancellation
//! - [`store`]: durable job records for restart recovery
//! - [`engine`]: the facade tying it together and running the dispatch loop
//!
//! The shared data model lives in the `sonaris-core` crate.

pub mod clock;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod engine;
pub mod error;
pub mod error_recovery;
pub mod executor;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod tasks;

pub use engine::{Engine, EngineBuilder};
pub use error::{AppResult, SonarisError};
