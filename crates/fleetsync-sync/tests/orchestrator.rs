use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use fleetsync_storage::ArtifactStore;
use fleetsync_sync::{
    Orchestrator, OrchestratorConfig, RunState, Stage, StageContext, StageReport, StageSettings,
};

/// Fails its first `failures` runs, then writes its artifact.
struct FlakyStage {
    id: &'static str,
    writes: Option<&'static str>,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyStage {
    fn new(
        id: &'static str,
        writes: Option<&'static str>,
        failures: u32,
    ) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                id,
                writes,
                failures,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Stage for FlakyStage {
    fn id(&self) -> &str {
        self.id
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            bail!("{} failed on call {call}", self.id);
        }
        if let Some(name) = self.writes {
            std::fs::write(ctx.artifacts.path_for(name), "IMEI #\n123\n")?;
        }
        Ok(StageReport::new(self.id))
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        artifacts: vec!["a.csv".into(), "b.csv".into()],
        retries: 3,
        settle: Duration::from_secs(2),
        poll_attempts: 3,
        poll_interval: Duration::from_secs(2),
        retry_backoff: Duration::from_secs(5),
        quiescence: Duration::from_secs(180),
    }
}

fn context(dir: &std::path::Path) -> StageContext {
    StageContext::new(ArtifactStore::new(dir), StageSettings::default())
}

#[tokio::test(start_paused = true)]
async fn second_stage_recovering_on_third_pass_succeeds_and_cleans_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (first, first_calls) = FlakyStage::new("export", Some("a.csv"), 0);
    let (second, second_calls) = FlakyStage::new("reconcile", Some("b.csv"), 2);
    let orchestrator = Orchestrator::new(
        config(),
        vec![Box::new(first), Box::new(second)],
        context(dir.path()),
    );

    let start = tokio::time::Instant::now();
    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.final_state, RunState::Success);
    assert!(outcome.succeeded());
    assert_eq!(outcome.passes, 3);
    assert_eq!(outcome.stage_failures.len(), 2);
    assert!(outcome.stage_failures.iter().all(|f| f.stage == "reconcile"));
    assert_eq!(first_calls.load(Ordering::SeqCst), 3);
    assert_eq!(second_calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.reports.len(), 2);

    assert_eq!(outcome.cleaned_up.len(), 2);
    assert_eq!(outcome.cleanup_error, None);
    assert!(!dir.path().join("a.csv").exists());
    assert!(!dir.path().join("b.csv").exists());
    // Two failed passes (settle + two poll waits + backoff), one clean pass
    // (settle), then the quiescence delay.
    assert!(start.elapsed() >= Duration::from_secs(2 * (2 + 4 + 5) + 2 + 180));
}

#[tokio::test(start_paused = true)]
async fn stage_failing_every_pass_exhausts_retries_and_keeps_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (first, _) = FlakyStage::new("export", Some("a.csv"), 0);
    let (second, second_calls) = FlakyStage::new("reconcile", Some("b.csv"), u32::MAX);
    let orchestrator = Orchestrator::new(
        config(),
        vec![Box::new(first), Box::new(second)],
        context(dir.path()),
    );

    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.passes, 3);
    assert_eq!(second_calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.stage_failures.len(), 3);
    assert_eq!(outcome.missing_artifacts, vec!["b.csv".to_string()]);
    assert!(outcome.cleaned_up.is_empty());
    assert!(dir.path().join("a.csv").exists());
}

#[tokio::test(start_paused = true)]
async fn artifacts_that_never_appear_fail_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (first, _) = FlakyStage::new("export", Some("a.csv"), 0);
    let (silent, _) = FlakyStage::new("reconcile", None, 0);
    let orchestrator = Orchestrator::new(
        config(),
        vec![Box::new(first), Box::new(silent)],
        context(dir.path()),
    );

    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.final_state, RunState::Failed);
    assert!(outcome.stage_failures.is_empty());
    assert_eq!(outcome.missing_artifacts, vec!["b.csv".to_string()]);
    assert!(dir.path().join("a.csv").exists());
}

#[tokio::test(start_paused = true)]
async fn first_stage_failure_stops_the_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (first, _) = FlakyStage::new("export", Some("a.csv"), 1);
    let (second, second_calls) = FlakyStage::new("reconcile", Some("b.csv"), 0);
    let orchestrator = Orchestrator::new(
        config(),
        vec![Box::new(first), Box::new(second)],
        context(dir.path()),
    );

    let outcome = orchestrator.run().await.expect("run");

    assert!(outcome.succeeded());
    assert_eq!(outcome.passes, 2);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_failure_is_reported_on_the_outcome() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (first, _) = FlakyStage::new("export", Some("a.csv"), 0);
    let (second, _) = FlakyStage::new("reconcile", Some("b.csv"), 0);
    let orchestrator = Orchestrator::new(
        config(),
        vec![Box::new(first), Box::new(second)],
        context(dir.path()),
    );

    // Halfway through quiescence, something puts a directory where an
    // artifact was, so deleting it fails.
    let blocked = dir.path().join("b.csv");
    let swap = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(100)).await;
        std::fs::remove_file(&blocked).expect("remove artifact");
        std::fs::create_dir(&blocked).expect("create dir");
    });

    let outcome = orchestrator.run().await.expect("run");
    swap.await.expect("swap task");

    assert!(outcome.succeeded());
    assert_eq!(outcome.passes, 1);
    assert_eq!(outcome.reports.len(), 2);
    let error = outcome.cleanup_error.expect("cleanup error recorded");
    assert!(error.contains("b.csv"), "{error}");
}
