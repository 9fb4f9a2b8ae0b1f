//! Reconciliation pipeline between the ticketing system and the deployment
//! sheet: schema loading, validation, merge, dedup, stages and the
//! retrying orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleetsync_adapters::{SmartsheetClient, ZendeskClient};
use fleetsync_storage::ArtifactStore;
use tracing::{info, warn};

pub mod config;
pub mod dedup;
pub mod merge;
pub mod orchestrator;
pub mod scheduler;
pub mod schema;
pub mod stages;
pub mod validate;

pub use config::{PipelineConfig, StageEntry, SyncConfig};
pub use merge::{index_by_key, merge, MergeKind, Merged};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome, RunState, StageFailure};
pub use scheduler::maybe_build_scheduler;
pub use stages::{Stage, StageContext, StageReport, StageSettings};
pub use validate::{canonicalize_record, validate, Anomaly, AnomalyReason, Validation};

pub const CRATE_NAME: &str = "fleetsync-sync";

/// Stage context wired to the HTTP clients. A client whose credentials are
/// missing is left out; stages that need it fail when they ask for it.
pub fn build_context(config: &SyncConfig) -> StageContext {
    let settings = StageSettings::from_config(config);
    let mut ctx = StageContext::new(ArtifactStore::new(config.artifacts_dir.clone()), settings);

    let zendesk = config
        .zendesk_config()
        .and_then(|zendesk| ZendeskClient::new(zendesk, config.http_client_config()));
    match zendesk {
        Ok(client) => ctx = ctx.with_ticket_store(Arc::new(client)),
        Err(err) => warn!(error = %err, "ticketing client unavailable"),
    }

    match SmartsheetClient::new(config.smartsheet_config(), config.http_client_config()) {
        Ok(client) => ctx = ctx.with_sheet_store(Arc::new(client)),
        Err(err) => warn!(error = %err, "sheet client unavailable"),
    }
    ctx
}

pub async fn build_orchestrator(config: &SyncConfig) -> Result<Orchestrator> {
    let pipeline = PipelineConfig::load(&config.pipeline_file).await?;
    let stages = stages::stages_for_pipeline(&pipeline)?;
    Ok(Orchestrator::new(
        OrchestratorConfig::from(&pipeline),
        stages,
        build_context(config),
    ))
}

pub async fn run_with_config(config: SyncConfig) -> Result<RunOutcome> {
    let orchestrator = build_orchestrator(&config).await?;
    orchestrator.run().await
}

pub async fn run_from_env() -> Result<RunOutcome> {
    run_with_config(SyncConfig::from_env()).await
}

/// Runs a single built-in stage once, outside the retry loop.
pub async fn run_stage_from_env(id: &str) -> Result<StageReport> {
    let config = SyncConfig::from_env();
    let stage =
        stages::builtin_stage(id).with_context(|| format!("no built-in stage named {id}"))?;
    let ctx = build_context(&config);
    info!(stage = id, "running single stage");
    stage.run(&ctx).await.with_context(|| format!("stage {id} failed"))
}
