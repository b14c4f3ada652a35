//! End-to-end scheduling scenarios against simulated instruments.

mod common;

use common::{at, engine_with_mock, run_due, t0, test_config};
use sonaris::clock::{Clock, ManualClock};
use sonaris::driver::{MockFault, MockInstrument};
use sonaris::scheduler::JobFilter;
use sonaris::SonarisError;
use sonaris_core::{
    Command, CommandOp, ErrorKind, JobDefinition, JobState, ResponseValidator, ScheduleRule,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn jobs_on_one_endpoint_run_in_submission_order() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202").with_latency(Duration::from_millis(20));
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    let j1 = engine
        .submit_job(
            JobDefinition::new("J1", "dg4202")
                .command(Command::write(":OUTP1 ON"))
                .command(Command::query(":OUTP1?").with_validator(ResponseValidator::exact("ON"))),
        )
        .expect("submit J1");
    let j2 = engine
        .submit_job(JobDefinition::new("J2", "dg4202").command(Command::write(":OUTP2 ON")))
        .expect("submit J2");

    assert_eq!(run_due(&engine).await, 2);

    let history: Vec<String> = mock.history().into_iter().map(|(_, text)| text).collect();
    assert_eq!(history, vec![":OUTP1 ON", ":OUTP1?", ":OUTP2 ON"]);
    assert_eq!(mock.max_concurrency(), 1);
    for id in [j1, j2] {
        assert_eq!(engine.get_job_status(&id).expect("job").state, JobState::Succeeded);
    }
    let stats = engine.session_stats();
    assert_eq!(stats.granted, 2);
    assert_eq!(stats.granted, stats.released + stats.revoked);
}

#[tokio::test]
async fn failed_validator_is_terminal_without_retry() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202");
    mock.respond(":OUTP1?", "OFF");
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    let id = engine
        .submit_job(
            JobDefinition::new("check output", "dg4202")
                .command(Command::query(":OUTP1?").with_validator(ResponseValidator::exact("ON")))
                .command(Command::write(":OUTP1 OFF")),
        )
        .expect("submit");
    run_due(&engine).await;

    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 0);
    let error = job.last_error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::ValidationFailure);
    assert_eq!(mock.history().len(), 1, "second command never sent");
}

#[tokio::test]
async fn timeouts_are_retried_until_success() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202");
    mock.fail_next_n(MockFault::Timeout, 2);
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    let id = engine
        .submit_job(
            JobDefinition::new("set frequency", "dg4202")
                .command(Command::write(":SOUR1:FREQ 1000"))
                .with_max_retries(3),
        )
        .expect("submit");
    run_due(&engine).await;

    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.retry_count, 2);
    assert!(job.last_error.is_none());
    assert_eq!(mock.writes().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_record_last_error() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202");
    mock.fail_next_n(MockFault::Io, 5);
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    let id = engine
        .submit_job(
            JobDefinition::new("flaky", "dg4202")
                .command(Command::write(":OUTP1 ON"))
                .with_max_retries(1),
        )
        .expect("submit");
    run_due(&engine).await;

    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.last_error.map(|e| e.kind), Some(ErrorKind::Io));
}

#[tokio::test]
async fn recurring_job_keeps_its_grid_despite_slow_runs() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202").with_latency(Duration::from_millis(30));
    let engine = engine_with_mock(test_config(), Arc::clone(&clock), "dg4202", &mock);

    let id = engine
        .submit_job(
            JobDefinition::new("poll output", "dg4202")
                .command(Command::write(":OUTP1 ON"))
                .with_schedule(ScheduleRule::every(Duration::from_secs(10))),
        )
        .expect("submit");

    let mut previous = t0();
    for run in 1..=3 {
        assert_eq!(engine.tick().expect("tick"), 1);
        // simulated execution delay, observed by the worker when it completes
        clock.advance(Duration::from_secs(3));
        engine.wait_idle().await;

        let entry = engine.scheduler().entry(&id).expect("re-armed");
        assert_eq!(entry.slot, at(10 * run));
        assert_eq!(entry.fire_at, entry.slot);
        assert!(entry.slot > previous);
        previous = entry.slot;

        assert_eq!(engine.tick().expect("tick"), 0, "not due before its slot");
        clock.set(entry.fire_at);
    }
    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(job.run_count, 3);
}

#[tokio::test]
async fn cancelling_finished_job_is_not_found() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202");
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    let id = engine
        .submit_job(JobDefinition::new("once", "dg4202").command(Command::write(":OUTP1 OFF")))
        .expect("submit");
    run_due(&engine).await;
    let before = engine.get_job_status(&id).expect("job");
    assert_eq!(before.state, JobState::Succeeded);

    let err = engine.cancel_job(&id).expect_err("terminal");
    assert!(matches!(err, SonarisError::JobNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(engine.get_job_status(&id).expect("job"), before);
}

#[tokio::test]
async fn cancelling_running_job_stops_at_command_boundary() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202").with_latency(Duration::from_millis(50));
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    let id = engine
        .submit_job(
            JobDefinition::new("long sequence", "dg4202")
                .command(Command::write(":SOUR1:FREQ 100"))
                .command(Command::write(":SOUR1:FREQ 200"))
                .command(Command::write(":SOUR1:FREQ 300")),
        )
        .expect("submit");
    engine.tick().expect("tick");
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.cancel_job(&id).expect("cancel running");
    engine.wait_idle().await;

    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(mock.writes().len(), 1);
    assert_eq!(engine.session_stats().active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_session_per_endpoint_under_load() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202").with_latency(Duration::from_millis(2));
    let engine = engine_with_mock(test_config(), clock, "dg4202", &mock);

    for n in 0..12 {
        engine
            .submit_job(
                JobDefinition::new(format!("job {n}"), "dg4202")
                    .command(Command::write(format!(":SOUR1:FREQ {n}")))
                    .command(Command::query("*OPC?").with_validator(ResponseValidator::exact("1"))),
            )
            .expect("submit");
    }
    assert_eq!(run_due(&engine).await, 12);

    assert_eq!(mock.max_concurrency(), 1);
    let writes = mock.writes();
    let expected: Vec<String> = (0..12).map(|n| format!(":SOUR1:FREQ {n}")).collect();
    assert_eq!(writes, expected);
    let queries = mock
        .history()
        .iter()
        .filter(|(op, _)| *op == CommandOp::Query)
        .count();
    assert_eq!(queries, 12);

    let succeeded = engine
        .list_jobs(JobFilter::all().with_state(JobState::Succeeded))
        .expect("list")
        .count();
    assert_eq!(succeeded, 12);
    let stats = engine.session_stats();
    assert_eq!(stats.granted, stats.released + stats.revoked);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn busy_endpoint_requeues_job_with_backoff() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mock = MockInstrument::new("dg4202");
    let mut config = test_config();
    config.scheduler.acquire_timeout = Duration::from_millis(30);
    config.retry.base_delay = Duration::from_secs(1);
    config.retry.max_delay = Duration::from_secs(4);
    let engine = engine_with_mock(config, Arc::clone(&clock), "dg4202", &mock);

    let holder = engine
        .sessions()
        .acquire(
            "dg4202",
            sonaris_core::JobId::new(),
            Duration::from_secs(60),
            Duration::from_millis(30),
        )
        .await
        .expect("manual session");

    let id = engine
        .submit_job(JobDefinition::new("blocked", "dg4202").command(Command::write(":OUTP1 ON")))
        .expect("submit");
    run_due(&engine).await;

    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(job.retry_count, 1);
    assert_eq!(
        job.last_error.map(|e| e.kind),
        Some(ErrorKind::ResourceUnavailable)
    );
    let entry = engine.scheduler().entry(&id).expect("re-queued");
    assert_eq!(entry.fire_at, clock.now() + chrono::Duration::seconds(1));

    holder.release();
    clock.advance(Duration::from_secs(1));
    assert_eq!(run_due(&engine).await, 1);
    let job = engine.get_job_status(&id).expect("job");
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.last_error.is_none());
}
