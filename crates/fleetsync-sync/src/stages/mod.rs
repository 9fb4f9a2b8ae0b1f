//! Pipeline stages. Each stage runs to completion or fails; its only
//! contract with the orchestrator is the artifacts it leaves behind.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fleetsync_adapters::{SheetStore, TicketStore};
use fleetsync_core::{recognized_field_names, Schema};
use fleetsync_storage::ArtifactStore;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{PipelineConfig, StageEntry, SyncConfig};
use crate::schema::load_sheet_schema;
use crate::validate::Anomaly;

mod command;
mod sheet;
mod tickets;

pub use command::CommandStage;
pub use sheet::{
    plan_upserts, repair_updates, row_record, ApplyUpserts, ReconcileSheet, RepairKeys,
    UpsertPlan,
};
pub use tickets::{comment_body, export_rows, group_by_ticket, ExportTickets, NotifyTickets};

pub const EXPORT_TICKETS: &str = "export-tickets";
pub const RECONCILE_SHEET: &str = "reconcile-sheet";
pub const APPLY_UPSERTS: &str = "apply-upserts";
pub const REPAIR_KEYS: &str = "repair-keys";
pub const NOTIFY_TICKETS: &str = "notify-tickets";

pub const TICKETS_ARTIFACT: &str = "zendesk_tickets.csv";
pub const SHEET_ARTIFACT: &str = "smartsheet_data.csv";

pub const QUEUE_ID_COLUMN: &str = "QUEUE_ID";
pub const WAITING_QUEUE_ID_COLUMN: &str = "WAITING_QUEUE_ID";
pub const FORM_ID_COLUMN: &str = "FORM_ID";

/// Column order of the ticket export.
pub fn ticket_export_header() -> Vec<&'static str> {
    let mut header = recognized_field_names();
    header.extend([QUEUE_ID_COLUMN, WAITING_QUEUE_ID_COLUMN, FORM_ID_COLUMN]);
    header
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSettings {
    pub form_id: String,
    pub queue_id: String,
    pub waiting_queue_id: String,
    pub date_format: String,
}

impl StageSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            form_id: config.zendesk_form_id.clone(),
            queue_id: config.zendesk_queue_id.clone(),
            waiting_queue_id: config.zendesk_waiting_queue_id.clone(),
            date_format: config.date_format.clone(),
        }
    }

    fn require(&self, name: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            bail!("{name} is not configured");
        }
        Ok(())
    }
}

/// Shared state handed to every stage of a run.
pub struct StageContext {
    pub artifacts: ArtifactStore,
    pub settings: StageSettings,
    tickets: Option<Arc<dyn TicketStore>>,
    sheet: Option<Arc<dyn SheetStore>>,
    /// Sheet columns discovered during the current pass.
    sheet_schema: Mutex<Option<Arc<Schema>>>,
}

impl StageContext {
    pub fn new(artifacts: ArtifactStore, settings: StageSettings) -> Self {
        Self {
            artifacts,
            settings,
            tickets: None,
            sheet: None,
            sheet_schema: Mutex::new(None),
        }
    }

    pub fn with_ticket_store(mut self, store: Arc<dyn TicketStore>) -> Self {
        self.tickets = Some(store);
        self
    }

    pub fn with_sheet_store(mut self, store: Arc<dyn SheetStore>) -> Self {
        self.sheet = Some(store);
        self
    }

    pub fn tickets(&self) -> Result<&dyn TicketStore> {
        self.tickets
            .as_deref()
            .context("ticketing system client is not configured")
    }

    pub fn sheet(&self) -> Result<&dyn SheetStore> {
        self.sheet
            .as_deref()
            .context("sheet client is not configured")
    }

    /// Sheet schema shared by every stage of the pass. The first caller pays
    /// the discovery round trip; a failed discovery is not cached.
    pub async fn sheet_schema(&self) -> Result<Arc<Schema>> {
        let mut cached = self.sheet_schema.lock().await;
        if let Some(schema) = cached.as_ref() {
            return Ok(schema.clone());
        }
        let schema = load_sheet_schema(self.sheet()?, &[])
            .await
            .context("loading sheet columns")?;
        let schema = Arc::new(schema);
        *cached = Some(schema.clone());
        Ok(schema)
    }

    /// Forgets per-pass state so the next pass sees the sheet as it is then.
    pub async fn begin_pass(&self) {
        if self.sheet_schema.lock().await.take().is_some() {
            debug!("dropped sheet schema from previous pass");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub artifacts: Vec<String>,
    pub rows: usize,
    pub updated: usize,
    pub inserted: usize,
    pub posted: usize,
    pub skipped: usize,
    pub anomalies: Vec<Anomaly>,
}

impl StageReport {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> Result<StageReport>;
}

pub fn builtin_stage(id: &str) -> Option<Box<dyn Stage>> {
    match id {
        EXPORT_TICKETS => Some(Box::new(ExportTickets)),
        RECONCILE_SHEET => Some(Box::new(ReconcileSheet)),
        APPLY_UPSERTS => Some(Box::new(ApplyUpserts)),
        REPAIR_KEYS => Some(Box::new(RepairKeys)),
        NOTIFY_TICKETS => Some(Box::new(NotifyTickets)),
        _ => None,
    }
}

pub fn stage_for_entry(entry: &StageEntry) -> Result<Box<dyn Stage>> {
    match entry {
        StageEntry::Builtin(id) => {
            builtin_stage(id).with_context(|| format!("no built-in stage named {id}"))
        }
        StageEntry::Command { id, command, args } => Ok(Box::new(CommandStage::new(
            id.clone(),
            command.clone(),
            args.clone(),
        ))),
    }
}

pub fn stages_for_pipeline(config: &PipelineConfig) -> Result<Vec<Box<dyn Stage>>> {
    config.stages.iter().map(stage_for_entry).collect()
}
