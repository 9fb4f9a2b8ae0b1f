//! Environment settings and the operator-tunable pipeline file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleetsync_adapters::{AdapterError, SmartsheetConfig, ZendeskConfig};
use fleetsync_core::DEFAULT_DATE_FORMAT;
use fleetsync_storage::{HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stages::{
    APPLY_UPSERTS, EXPORT_TICKETS, NOTIFY_TICKETS, RECONCILE_SHEET, REPAIR_KEYS, SHEET_ARTIFACT,
    TICKETS_ARTIFACT,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub zendesk_subdomain: String,
    pub zendesk_base_url: Option<String>,
    pub zendesk_email: String,
    pub zendesk_api_token: String,
    pub zendesk_form_id: String,
    pub zendesk_queue_id: String,
    pub zendesk_waiting_queue_id: String,
    pub smartsheet_token: String,
    pub smartsheet_sheet_id: String,
    pub smartsheet_api_base_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub pipeline_file: PathBuf,
    pub date_format: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Credentials default to empty;
    /// client construction reports what is missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let text = |key: &str| var(key).unwrap_or_default();
        Self {
            zendesk_subdomain: text("ZENDESK_SUBDOMAIN"),
            zendesk_base_url: var("ZENDESK_BASE_URL"),
            zendesk_email: text("ZENDESK_EMAIL"),
            zendesk_api_token: text("ZENDESK_API_TOKEN"),
            zendesk_form_id: text("ZENDESK_FORM_ID"),
            zendesk_queue_id: text("ZENDESK_QUEUE_ID"),
            zendesk_waiting_queue_id: text("ZENDESK_WAITING_QUEUE_ID"),
            smartsheet_token: text("SMARTSHEET_TOKEN"),
            smartsheet_sheet_id: text("SMARTSHEET_SHEET_ID"),
            smartsheet_api_base_url: var("SMARTSHEET_API_BASE_URL"),
            artifacts_dir: var("FLEETSYNC_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            pipeline_file: var("FLEETSYNC_PIPELINE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./pipeline.yaml")),
            date_format: var("FLEETSYNC_DATE_FORMAT")
                .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string()),
            http_timeout_secs: var("FLEETSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: var("FLEETSYNC_USER_AGENT")
                .unwrap_or_else(|| "fleetsync/0.1".to_string()),
            scheduler_enabled: var("FLEETSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("FLEETSYNC_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            // Both APIs throttle at a few hundred requests per minute.
            token_bucket: Some(TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(250),
            }),
        }
    }

    pub fn zendesk_config(&self) -> Result<ZendeskConfig, AdapterError> {
        if let Some(base_url) = &self.zendesk_base_url {
            return Ok(ZendeskConfig {
                base_url: base_url.clone(),
                email: self.zendesk_email.clone(),
                api_token: self.zendesk_api_token.clone(),
            });
        }
        if self.zendesk_subdomain.is_empty() {
            return Err(AdapterError::Configuration {
                system: "zendesk",
                missing: "ZENDESK_SUBDOMAIN",
            });
        }
        Ok(ZendeskConfig::for_subdomain(
            &self.zendesk_subdomain,
            self.zendesk_email.clone(),
            self.zendesk_api_token.clone(),
        ))
    }

    pub fn smartsheet_config(&self) -> SmartsheetConfig {
        SmartsheetConfig {
            base_url: self.smartsheet_api_base_url.clone().unwrap_or_default(),
            token: self.smartsheet_token.clone(),
            sheet_id: self.smartsheet_sheet_id.clone(),
        }
    }
}

/// One pipeline entry: a built-in stage id or an external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageEntry {
    Builtin(String),
    Command {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl StageEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::Builtin(id) => id,
            Self::Command { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub stages: Vec<StageEntry>,
    /// Artifact file names relative to the artifacts directory.
    pub artifacts: Vec<String>,
    /// Full passes over the stage list before giving up.
    pub retries: u32,
    pub settle_secs: u64,
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
    pub retry_backoff_secs: u64,
    pub quiescence_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: [
                EXPORT_TICKETS,
                RECONCILE_SHEET,
                APPLY_UPSERTS,
                REPAIR_KEYS,
                NOTIFY_TICKETS,
            ]
            .into_iter()
            .map(|id| StageEntry::Builtin(id.to_string()))
            .collect(),
            artifacts: vec![TICKETS_ARTIFACT.to_string(), SHEET_ARTIFACT.to_string()],
            retries: 3,
            settle_secs: 2,
            poll_attempts: 3,
            poll_interval_secs: 2,
            retry_backoff_secs: 5,
            quiescence_secs: 180,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("parsing pipeline config yaml")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, or falls back to the built-in pipeline when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::from_yaml_str(&raw)
                .with_context(|| format!("loading pipeline config {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no pipeline file; using built-in pipeline");
                Ok(Self::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("reading pipeline config {}", path.display()))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("pipeline config lists no stages");
        }
        if self.retries == 0 {
            bail!("pipeline retries must be at least 1");
        }
        if self.poll_attempts == 0 {
            bail!("pipeline poll_attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.artifacts_dir, PathBuf::from("./artifacts"));
        assert_eq!(config.pipeline_file, PathBuf::from("./pipeline.yaml"));
        assert_eq!(config.date_format, DEFAULT_DATE_FORMAT);
        assert_eq!(config.http_timeout_secs, 20);
        assert!(!config.scheduler_enabled);
        assert!(matches!(
            config.zendesk_config(),
            Err(AdapterError::Configuration {
                missing: "ZENDESK_SUBDOMAIN",
                ..
            })
        ));
    }

    #[test]
    fn env_values_override_defaults() {
        let vars = HashMap::from([
            ("ZENDESK_SUBDOMAIN", "acme"),
            ("ZENDESK_EMAIL", "ops@acme.test"),
            ("FLEETSYNC_HTTP_TIMEOUT_SECS", "45"),
            ("FLEETSYNC_SCHEDULER_ENABLED", "true"),
            ("SMARTSHEET_API_BASE_URL", "   "),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.http_timeout_secs, 45);
        assert!(config.scheduler_enabled);
        assert_eq!(config.smartsheet_api_base_url, None);
        let zendesk = config.zendesk_config().expect("zendesk config");
        assert_eq!(zendesk.base_url, "https://acme.zendesk.com/api/v2");
        assert_eq!(zendesk.email, "ops@acme.test");
    }

    #[test]
    fn pipeline_yaml_mixes_builtin_and_command_stages() {
        let config = PipelineConfig::from_yaml_str(
            r#"
stages:
  - export-tickets
  - id: legacy-report
    command: python3
    args: ["report.py"]
artifacts: [zendesk_tickets.csv]
retries: 2
quiescence_secs: 0
"#,
        )
        .expect("parse");
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0], StageEntry::Builtin(EXPORT_TICKETS.into()));
        assert_eq!(config.stages[1].id(), "legacy-report");
        assert_eq!(config.retries, 2);
        assert_eq!(config.poll_attempts, 3);
        assert_eq!(config.quiescence_secs, 0);
    }

    #[test]
    fn shipped_pipeline_file_matches_builtin_pipeline() {
        let config = PipelineConfig::from_yaml_str(include_str!("../../../pipeline.yaml"))
            .expect("parse pipeline.yaml");
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn pipeline_rejects_zero_retries() {
        let err = PipelineConfig::from_yaml_str("retries: 0").unwrap_err();
        assert!(err.to_string().contains("retries"));
    }

    #[tokio::test]
    async fn missing_pipeline_file_uses_builtin_pipeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::load(&dir.path().join("absent.yaml"))
            .await
            .expect("load");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.stages.len(), 5);
        assert_eq!(config.artifacts, vec![TICKETS_ARTIFACT, SHEET_ARTIFACT]);
    }
}
