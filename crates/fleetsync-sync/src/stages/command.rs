use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{Stage, StageContext, StageReport};

/// A pipeline step delegated to an external program. A non-zero exit fails
/// the stage. The program finds the artifacts directory in
/// `FLEETSYNC_ARTIFACTS_DIR`.
#[derive(Debug, Clone)]
pub struct CommandStage {
    id: String,
    command: String,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let root = ctx.artifacts.root();
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("creating artifacts directory {}", root.display()))?;

        info!(command = %self.command, args = ?self.args, "running external stage");
        let status = Command::new(&self.command)
            .args(&self.args)
            .env("FLEETSYNC_ARTIFACTS_DIR", root)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("spawning {}", self.command))?;
        if !status.success() {
            bail!("stage {} exited with {status}", self.id);
        }
        Ok(StageReport::new(&self.id))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stages::StageSettings;
    use fleetsync_storage::ArtifactStore;

    fn sh(script: &str) -> CommandStage {
        CommandStage::new("script", "sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn zero_exit_succeeds_and_sees_the_artifacts_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = StageContext::new(ArtifactStore::new(dir.path()), StageSettings::default());

        let report = sh("echo 'IMEI #' > \"$FLEETSYNC_ARTIFACTS_DIR/out.csv\"")
            .run(&ctx)
            .await
            .expect("stage");
        assert_eq!(report.stage, "script");
        assert!(ctx.artifacts.exists("out.csv"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = StageContext::new(ArtifactStore::new(dir.path()), StageSettings::default());
        let err = sh("exit 3").run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
