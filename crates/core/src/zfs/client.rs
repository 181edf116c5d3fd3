//! Asynchronous `zfs` CLI backend.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::parser::{parse_children, parse_names, parse_snapshots};
use crate::backend::StorageBackend;
use crate::config::TransferConfig;
use crate::errors::ZfsError;
use crate::models::{DatasetPath, InventoryEntry, SnapshotInfo, SnapshotRef};
use crate::pipeline::{describe, run_pipeline, PipeStatus, Stage};

/// [`StorageBackend`] that shells out to the `zfs` binary.
#[derive(Debug, Clone)]
pub struct ZfsBackend {
    zfs_bin: String,
    send_flags: Vec<String>,
    receive_flags: Vec<String>,
    buffer: Option<Stage>,
}

impl ZfsBackend {
    pub fn new(config: &TransferConfig) -> Self {
        let backend = Self {
            zfs_bin: config.zfs_bin.clone(),
            send_flags: config.send_flags.clone(),
            receive_flags: config.receive_flags.clone(),
            buffer: Stage::from_argv(&config.buffer_command),
        };
        info!(zfs = %backend.zfs_bin, buffered = backend.buffer.is_some(), "created ZfsBackend");
        backend
    }

    /// The send, buffer and receive stages for one incremental transfer.
    pub fn transfer_stages(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
        dest_root: &DatasetPath,
    ) -> Vec<Stage> {
        let mut send_args = vec!["send".to_string()];
        send_args.extend(self.send_flags.iter().cloned());
        send_args.extend(["-I".to_string(), from.to_string(), to.to_string()]);

        let mut receive_args = vec!["receive".to_string()];
        receive_args.extend(self.receive_flags.iter().cloned());
        receive_args.push(dest_root.to_string());

        let mut stages = vec![Stage::new(self.zfs_bin.clone(), send_args)];
        stages.extend(self.buffer.clone());
        stages.push(Stage::new(self.zfs_bin.clone(), receive_args));
        stages
    }

    /// Run `zfs` with `args`. `subject` is the dataset the command acts on;
    /// a "does not exist" failure is reported against it.
    async fn run_zfs(&self, subject: &str, args: &[&str]) -> Result<String, ZfsError> {
        let mut cmd = Command::new(&self.zfs_bin);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let command = format!("{} {}", self.zfs_bin, args.join(" "));
        debug!(cmd = %command, "running zfs command");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ZfsError::BinaryNotFound(self.zfs_bin.clone())
            } else {
                ZfsError::IoError(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "zfs command failed");
            return Err(command_error(subject, command, exit_code, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Map a failed `zfs` invocation to an error.
fn command_error(subject: &str, command: String, exit_code: i32, stderr: String) -> ZfsError {
    if stderr.contains("does not exist") {
        ZfsError::DatasetNotFound(subject.to_string())
    } else {
        ZfsError::CommandFailed {
            command,
            exit_code,
            stderr,
        }
    }
}

#[async_trait]
impl StorageBackend for ZfsBackend {
    #[instrument(skip_all, fields(root = %root))]
    async fn list_children(&self, root: &DatasetPath) -> Result<Vec<InventoryEntry>, ZfsError> {
        let output = self
            .run_zfs(root.as_str(), &[
                "list", "-H", "-p", "-d", "1", "-t", "filesystem", "-o", "name,origin", "-s",
                "creation", root.as_str(),
            ])
            .await?;
        parse_children(&output, root)
    }

    #[instrument(skip_all, fields(dataset = %dataset))]
    async fn list_snapshots(&self, dataset: &DatasetPath) -> Result<Vec<SnapshotInfo>, ZfsError> {
        let output = self
            .run_zfs(dataset.as_str(), &[
                "list", "-H", "-p", "-d", "1", "-t", "snapshot", "-o", "name,creation", "-s",
                "creation", dataset.as_str(),
            ])
            .await?;
        let mut snapshots = parse_snapshots(&output)?;
        snapshots.retain(|info| &info.snapshot.dataset == dataset);
        Ok(snapshots)
    }

    #[instrument(skip_all, fields(dataset = %dataset))]
    async fn has_child_datasets(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        let output = self
            .run_zfs(dataset.as_str(), &[
                "list", "-H", "-r", "-t", "filesystem,volume", "-o", "name",
                dataset.as_str(),
            ])
            .await?;
        Ok(parse_names(&output)?
            .iter()
            .any(|name| name.is_under(dataset)))
    }

    async fn dataset_exists(&self, dataset: &DatasetPath) -> Result<bool, ZfsError> {
        let args = ["list", "-H", "-o", "name", dataset.as_str()];
        match self.run_zfs(dataset.as_str(), &args).await {
            Ok(_) => Ok(true),
            Err(ZfsError::DatasetNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(snapshot = %snapshot))]
    async fn create_snapshot(
        &self,
        snapshot: &SnapshotRef,
        recursive: bool,
    ) -> Result<(), ZfsError> {
        let name = snapshot.to_string();
        if recursive {
            self.run_zfs(snapshot.dataset.as_str(), &["snapshot", "-r", &name])
                .await?;
        } else {
            self.run_zfs(snapshot.dataset.as_str(), &["snapshot", &name])
                .await?;
        }
        info!(%snapshot, recursive, "snapshot created");
        Ok(())
    }

    #[instrument(skip_all, fields(from = %from, to = %to))]
    async fn rename_dataset(&self, from: &DatasetPath, to: &DatasetPath) -> Result<(), ZfsError> {
        self.run_zfs(from.as_str(), &["rename", from.as_str(), to.as_str()]).await?;
        info!(%from, %to, "dataset renamed");
        Ok(())
    }

    #[instrument(skip_all, fields(dataset = %dataset))]
    async fn set_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
        value: &str,
    ) -> Result<(), ZfsError> {
        let assignment = format!("{}={}", property, value);
        self.run_zfs(dataset.as_str(), &["set", &assignment, dataset.as_str()]).await?;
        debug!(%dataset, property, value, "property set");
        Ok(())
    }

    #[instrument(skip_all, fields(dataset = %dataset))]
    async fn inherit_property(
        &self,
        dataset: &DatasetPath,
        property: &str,
    ) -> Result<(), ZfsError> {
        self.run_zfs(dataset.as_str(), &["inherit", property, dataset.as_str()]).await?;
        debug!(%dataset, property, "property inherited");
        Ok(())
    }

    #[instrument(skip_all, fields(from = %from, to = %to, dest_root = %dest_root))]
    async fn transfer_incremental(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
        dest_root: &DatasetPath,
    ) -> Result<PipeStatus, ZfsError> {
        let stages = self.transfer_stages(from, to, dest_root);
        info!(pipeline = %describe(&stages), "starting incremental transfer");
        run_pipeline(&stages).await
    }

    fn describe_transfer(&self, from: &SnapshotRef, to: &SnapshotRef, dest_root: &DatasetPath) -> String {
        describe(&self.transfer_stages(from, to, dest_root))
    }
}
