//! Control-plane client used by the transfer test.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use transit_tracker::EntityId;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Failed to run {0}: {1}")]
    Spawn(String, std::io::Error),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected output from `{0}`")]
    InvalidOutput(String),
}

/// A file to register with the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub path: PathBuf,
    /// Location the file is uploaded to
    pub rse: String,
    pub scope: String,
    pub lifetime_secs: u64,
    pub transfer_timeout_secs: u64,
}

/// Operations the transfer test drives
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Upload and register one file
    async fn upload(&self, item: &UploadItem) -> Result<(), ControlPlaneError>;

    /// Create a dataset holding `files`; returns its `scope:name`
    async fn create_dataset(
        &self,
        scope: &str,
        name: &str,
        files: &[EntityId],
        lifetime_secs: u64,
    ) -> Result<String, ControlPlaneError>;

    /// Request `copies` replicas of `dataset` at `destination`; returns the rule id
    async fn add_rule(
        &self,
        dataset: &str,
        destination: &str,
        copies: u32,
        lifetime_secs: u64,
    ) -> Result<String, ControlPlaneError>;
}

/// Drives the `rucio` command-line client
#[derive(Debug, Clone)]
pub struct RucioCli {
    program: PathBuf,
    account: String,
}

impl RucioCli {
    pub fn new(program: impl Into<PathBuf>, account: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            account: account.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn upload_args(&self, item: &UploadItem) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "upload".to_string(),
            "--rse".to_string(),
            item.rse.clone(),
            "--scope".to_string(),
            item.scope.clone(),
            "--lifetime".to_string(),
            item.lifetime_secs.to_string(),
            "--transfer-timeout".to_string(),
            item.transfer_timeout_secs.to_string(),
            item.path.display().to_string(),
        ]);
        args
    }

    pub fn add_dataset_args(&self, did: &str, lifetime_secs: u64) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "add-dataset".to_string(),
            "--lifetime".to_string(),
            lifetime_secs.to_string(),
            did.to_string(),
        ]);
        args
    }

    pub fn attach_args(&self, did: &str, files: &[EntityId]) -> Vec<String> {
        let mut args = self.base_args();
        args.push("attach".to_string());
        args.push(did.to_string());
        args.extend(files.iter().map(|f| f.to_string()));
        args
    }

    pub fn add_rule_args(
        &self,
        dataset: &str,
        destination: &str,
        copies: u32,
        lifetime_secs: u64,
    ) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "add-rule".to_string(),
            "--lifetime".to_string(),
            lifetime_secs.to_string(),
            dataset.to_string(),
            copies.to_string(),
            destination.to_string(),
        ]);
        args
    }

    fn base_args(&self) -> Vec<String> {
        vec!["-a".to_string(), self.account.clone()]
    }

    /// Run the client and return its trimmed stdout
    async fn exec(&self, args: Vec<String>) -> Result<String, ControlPlaneError> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        debug!(command = %command, "Running control-plane command");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ControlPlaneError::Spawn(self.program.display().to_string(), e))?;

        if !output.status.success() {
            return Err(ControlPlaneError::Failed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ControlPlane for RucioCli {
    async fn upload(&self, item: &UploadItem) -> Result<(), ControlPlaneError> {
        self.exec(self.upload_args(item)).await?;
        info!(path = %item.path.display(), rse = %item.rse, "Uploaded file");
        Ok(())
    }

    async fn create_dataset(
        &self,
        scope: &str,
        name: &str,
        files: &[EntityId],
        lifetime_secs: u64,
    ) -> Result<String, ControlPlaneError> {
        let did = format!("{scope}:{name}");
        self.exec(self.add_dataset_args(&did, lifetime_secs)).await?;
        self.exec(self.attach_args(&did, files)).await?;
        info!(dataset = %did, files = files.len(), "Created dataset");
        Ok(did)
    }

    async fn add_rule(
        &self,
        dataset: &str,
        destination: &str,
        copies: u32,
        lifetime_secs: u64,
    ) -> Result<String, ControlPlaneError> {
        let args = self.add_rule_args(dataset, destination, copies, lifetime_secs);
        let command = args.join(" ");
        let stdout = self.exec(args).await?;
        // the client prints the new rule id as the last line
        let rule_id = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ControlPlaneError::InvalidOutput(command))?;
        Ok(rule_id.to_string())
    }
}
