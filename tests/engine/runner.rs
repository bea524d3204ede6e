use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use registry_mirror::{MirrorFactory, RunController, Runner};
use tokio::time::Instant;

use crate::support::fakes::{Behavior, FakeConnector, FakeDestination, ScriptedMirrorFactory};
use crate::support::helpers::{init_tracing, run_config, wait_until};

fn runner(connector: FakeConnector, factory: &ScriptedMirrorFactory, names: &[&str]) -> Runner {
    let controller = RunController::new(
        run_config(names, 2),
        Arc::new(connector),
        Arc::new(factory.clone()) as Arc<dyn MirrorFactory>,
    );
    Runner::new(Arc::new(controller))
}

#[tokio::test(start_paused = true)]
async fn runs_immediately_and_then_on_every_tick() -> Result<()> {
    init_tracing();
    let factory = ScriptedMirrorFactory::new(&[]);
    let runner = Arc::new(runner(
        FakeConnector::new(FakeDestination::with_pages(&[&[]])),
        &factory,
        &["r1"],
    ));
    let started = Instant::now();

    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run_until_cancelled().await }
    });

    wait_until(|| factory.works() >= 1, Duration::from_secs(1), "first run").await?;
    assert!(started.elapsed() < Duration::from_secs(60), "first run starts without waiting");

    wait_until(|| factory.works() >= 3, Duration::from_secs(600), "scheduled runs").await?;
    assert!(started.elapsed() >= Duration::from_secs(120));

    runner.stop();
    handle.await??;

    let telemetry = runner.controller().telemetry().snapshot();
    assert!(telemetry.runs_completed >= 3);
    assert_eq!(telemetry.jobs_failed(), 0);
    assert_eq!(runner.controller().worker_count(), 0, "workers are joined on exit");
    Ok(())
}

#[tokio::test]
async fn fatal_run_error_stops_the_runner() -> Result<()> {
    init_tracing();
    let factory = ScriptedMirrorFactory::new(&[]);
    let runner = runner(
        FakeConnector::new(FakeDestination::with_pages(&[&[]])).failing_source(),
        &factory,
        &["r1"],
    );

    let err = tokio::time::timeout(Duration::from_secs(5), runner.run_until_cancelled())
        .await?
        .expect_err("source failure should stop the runner");

    assert!(
        format!("{err:#}").contains("could not connect to source registry"),
        "unexpected error: {err:#}"
    );
    assert!(runner.cancellation_token().is_cancelled());
    assert!(factory.setups().is_empty());
    Ok(())
}

#[tokio::test]
async fn stop_cancels_in_flight_jobs() -> Result<()> {
    init_tracing();
    let factory = ScriptedMirrorFactory::new(&[("r1", Behavior::WaitForCancel)]);
    let runner = Arc::new(runner(
        FakeConnector::new(FakeDestination::with_pages(&[&[]])),
        &factory,
        &["r1", "r2"],
    ));

    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run_until_cancelled().await }
    });
    tokio::time::timeout(Duration::from_secs(5), factory.wait_until_entered()).await?;

    runner.stop();
    tokio::time::timeout(Duration::from_secs(5), handle).await???;

    wait_until(|| factory.cancelled() == 1, Duration::from_secs(5), "job cancellation").await?;
    assert_eq!(runner.controller().telemetry().snapshot().runs_completed, 0);
    Ok(())
}

#[tokio::test]
async fn stopping_before_start_runs_nothing() -> Result<()> {
    init_tracing();
    let factory = ScriptedMirrorFactory::new(&[]);
    let runner = runner(
        FakeConnector::new(FakeDestination::with_pages(&[&[]])),
        &factory,
        &["r1"],
    );

    runner.stop();
    runner.run_until_cancelled().await?;

    assert!(factory.setups().is_empty());
    Ok(())
}
