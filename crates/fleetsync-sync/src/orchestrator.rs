//! Run state machine: run every stage in order, wait for the artifacts, then
//! either clean up after a quiescence delay or start the whole pass again.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::stages::{Stage, StageContext, StageReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Artifacts every successful pass must leave behind.
    pub artifacts: Vec<String>,
    /// Full passes attempted before the run is failed.
    pub retries: u32,
    pub settle: Duration,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub quiescence: Duration,
}

impl From<&PipelineConfig> for OrchestratorConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            artifacts: config.artifacts.clone(),
            retries: config.retries.max(1),
            settle: Duration::from_secs(config.settle_secs),
            poll_attempts: config.poll_attempts.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            quiescence: Duration::from_secs(config.quiescence_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    RunStages { pass: u32 },
    WaitForArtifacts { pass: u32, stages_ok: bool },
    Retry { remaining: u32 },
    Success,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub pass: u32,
    pub stage: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: RunState,
    pub passes: u32,
    pub stage_failures: Vec<StageFailure>,
    /// Artifacts still absent after the last poll.
    pub missing_artifacts: Vec<String>,
    pub cleaned_up: Vec<PathBuf>,
    /// Set when the run succeeded but its artifacts could not be deleted.
    pub cleanup_error: Option<String>,
    /// Reports of the stages that completed in the last pass.
    pub reports: Vec<StageReport>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.final_state == RunState::Success
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    stages: Vec<Box<dyn Stage>>,
    ctx: StageContext,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, stages: Vec<Box<dyn Stage>>, ctx: StageContext) -> Self {
        Self {
            config,
            stages,
            ctx,
        }
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let mut outcome = RunOutcome {
            run_id,
            started_at,
            finished_at: started_at,
            final_state: RunState::RunStages { pass: 1 },
            passes: 0,
            stage_failures: Vec::new(),
            missing_artifacts: Vec::new(),
            cleaned_up: Vec::new(),
            cleanup_error: None,
            reports: Vec::new(),
        };
        info!(
            stages = self.stages.len(),
            retries = self.config.retries,
            "starting sync run"
        );

        let mut state = RunState::RunStages { pass: 1 };
        while !state.is_terminal() {
            state = match state {
                RunState::RunStages { pass } => {
                    outcome.passes = pass;
                    let stages_ok = self.run_stages(pass, &mut outcome).await;
                    tokio::time::sleep(self.config.settle).await;
                    RunState::WaitForArtifacts { pass, stages_ok }
                }
                RunState::WaitForArtifacts { pass, stages_ok } => {
                    outcome.missing_artifacts = self.poll_artifacts().await;
                    let remaining = self.config.retries.saturating_sub(pass);
                    if stages_ok && outcome.missing_artifacts.is_empty() {
                        RunState::Success
                    } else if remaining > 0 {
                        warn!(
                            pass,
                            remaining,
                            missing = ?outcome.missing_artifacts,
                            "pass incomplete; retrying"
                        );
                        RunState::Retry { remaining }
                    } else {
                        RunState::Failed
                    }
                }
                RunState::Retry { remaining } => {
                    tokio::time::sleep(self.config.retry_backoff).await;
                    RunState::RunStages {
                        pass: self.config.retries - remaining + 1,
                    }
                }
                terminal => terminal,
            };
        }

        match state {
            RunState::Success => {
                info!(
                    quiescence_secs = self.config.quiescence.as_secs(),
                    "all stages succeeded; waiting before cleanup"
                );
                tokio::time::sleep(self.config.quiescence).await;
                match self
                    .ctx
                    .artifacts
                    .delete(self.config.artifacts.iter().map(String::as_str))
                    .await
                {
                    Ok(deleted) => outcome.cleaned_up = deleted,
                    Err(err) => {
                        error!(error = ?err, "artifact cleanup failed");
                        outcome.cleanup_error = Some(format!("{err:#}"));
                    }
                }
                info!(deleted = outcome.cleaned_up.len(), "sync run succeeded");
            }
            _ => {
                error!(
                    passes = outcome.passes,
                    failures = outcome.stage_failures.len(),
                    artifacts_dir = %self.ctx.artifacts.root().display(),
                    "sync run failed; artifacts kept for inspection"
                );
            }
        }

        outcome.final_state = state;
        outcome.finished_at = Utc::now();
        Ok(outcome)
    }

    /// Runs the stages in order, stopping at the first failure.
    async fn run_stages(&self, pass: u32, outcome: &mut RunOutcome) -> bool {
        outcome.reports.clear();
        self.ctx.begin_pass().await;
        for stage in &self.stages {
            let span = info_span!("stage", stage = stage.id(), pass);
            match stage.run(&self.ctx).instrument(span).await {
                Ok(report) => {
                    info!(stage = stage.id(), pass, "stage finished");
                    outcome.reports.push(report);
                }
                Err(err) => {
                    error!(stage = stage.id(), pass, error = ?err, "stage failed");
                    outcome.stage_failures.push(StageFailure {
                        pass,
                        stage: stage.id().to_string(),
                        error: format!("{err:#}"),
                    });
                    return false;
                }
            }
        }
        true
    }

    /// Missing artifact names after up to `poll_attempts` checks.
    async fn poll_artifacts(&self) -> Vec<String> {
        let names = self.config.artifacts.iter().map(String::as_str);
        let mut missing = self.ctx.artifacts.missing(names.clone());
        for attempt in 1..self.config.poll_attempts {
            if missing.is_empty() {
                break;
            }
            info!(attempt, missing = ?missing, "artifacts not present yet");
            tokio::time::sleep(self.config.poll_interval).await;
            missing = self.ctx.artifacts.missing(names.clone());
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_values_convert_to_durations() {
        let pipeline = PipelineConfig {
            settle_secs: 1,
            quiescence_secs: 60,
            ..PipelineConfig::default()
        };
        let config = OrchestratorConfig::from(&pipeline);
        assert_eq!(config.settle, Duration::from_secs(1));
        assert_eq!(config.quiescence, Duration::from_secs(60));
        assert_eq!(config.retries, 3);
        assert_eq!(config.artifacts.len(), 2);
    }

    #[test]
    fn only_success_and_failure_end_a_run() {
        assert!(RunState::Success.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Retry { remaining: 1 }.is_terminal());
        assert!(!RunState::WaitForArtifacts {
            pass: 1,
            stages_ok: true
        }
        .is_terminal());
    }
}
