//! Backup workflow orchestration
//!
//! One run walks `Init → Quiesced → Archived → Uploaded → Restored → Done`,
//! dropping into `Failed` from any stage. Once the workload has been scaled
//! down, the restore action runs exactly once whatever happens afterwards,
//! under its own deadline, and its error is merged with the main-path error.
//! Exactly one notification goes out per run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snapback_models::{ArchiveArtifact, RunOutcome, WorkloadRef, ARCHIVE_CONTENT_TYPE};
use tokio::time::Instant;
use tracing::Instrument;

use crate::archive::Archiver;
use crate::error::BackupError;
use crate::k8s_client::ClusterApi;
use crate::log_capture::LogCapture;
use crate::notify::Notifier;
use crate::progress::ProgressReader;
use crate::quiesce::{quiesce, RestoreAction, WaitOptions};
use crate::storage::{ObjectStore, PutOptions};

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub bucket: String,
    pub storage_class: Option<String>,
    /// How long the object should be kept; `None` means forever
    pub archive_lifetime: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Bounds quiesce, wait, archive and upload together
    pub run: Duration,
    /// Bounds the restore alone
    pub restore: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            run: Duration::from_secs(600),
            restore: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub workload: WorkloadRef,
    /// Wait for the pods to terminate after scaling down
    pub wait: Option<WaitOptions>,
    pub backup_directory: PathBuf,
    /// Where the temporary archive is written
    pub scratch_directory: PathBuf,
    pub upload: UploadSettings,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Quiesced,
    Archived,
    Uploaded,
    Restored,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Quiesced => "quiesced",
            Stage::Archived => "archived",
            Stage::Uploaded => "uploaded",
            Stage::Restored => "restored",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one run produced, before it is turned into a result
struct RunReport {
    stage: Stage,
    /// Last stage reached before the run went wrong
    failed_at: Option<Stage>,
    archive: Option<ArchiveArtifact>,
    error: Option<BackupError>,
}

pub struct BackupWorkflow {
    settings: WorkflowSettings,
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn ObjectStore>,
    notifier: Option<Arc<dyn Notifier>>,
    logs: LogCapture,
}

impl BackupWorkflow {
    pub fn new(
        settings: WorkflowSettings,
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn ObjectStore>,
        logs: LogCapture,
    ) -> Self {
        Self {
            settings,
            cluster,
            store,
            notifier: None,
            logs,
        }
    }

    /// Report the outcome through `notifier`; without one the run is silent
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run the backup once and notify about it.
    ///
    /// Returns the uploaded archive; its local file is already gone.
    pub async fn run(&self) -> Result<ArchiveArtifact, BackupError> {
        let workload = &self.settings.workload;
        let span = tracing::info_span!(
            "backup",
            resource = %workload,
            namespace = %workload.namespace,
        );

        let report = self.execute().instrument(span.clone()).await;

        let outcome = {
            let _entered = span.enter();
            match &report.error {
                Some(err) => {
                    let stage = report.failed_at.unwrap_or(report.stage);
                    tracing::error!(stage = %stage, error = %err, "Backup failed");
                }
                None => tracing::info!(stage = %report.stage, "Backup succeeded"),
            }

            RunOutcome {
                workload: workload.to_string(),
                succeeded: report.error.is_none(),
                archive_size_bytes: report.archive.as_ref().map(|archive| archive.size_bytes),
                error: report.error.as_ref().map(ToString::to_string),
                captured_log: self.logs.contents(),
            }
        };

        self.notify(&outcome).instrument(span).await;

        match (report.error, report.archive) {
            (Some(err), _) => Err(err),
            (None, Some(archive)) => Ok(archive),
            (None, None) => Err(BackupError::Archive {
                directory: self.settings.backup_directory.clone(),
                archive_path: self.settings.scratch_directory.clone(),
                cause: std::io::Error::other("run finished without an archive"),
            }),
        }
    }

    async fn execute(&self) -> RunReport {
        let deadline = Instant::now() + self.settings.timeouts.run;
        let mut stage = Stage::Init;

        // 1. Quiesce: nothing to undo if this fails
        let restore = match quiesce(
            self.cluster.clone(),
            &self.settings.workload,
            self.settings.wait,
            deadline,
        )
        .await
        {
            Ok(restore) => restore,
            Err(err) => {
                tracing::error!(stage = %stage, error = %err, "Failed to scale down");
                return RunReport {
                    stage: Stage::Failed,
                    failed_at: Some(stage),
                    archive: None,
                    error: Some(err),
                };
            }
        };
        advance(&mut stage, Stage::Quiesced);

        // 2. Archive and upload; the restore below runs whatever the outcome
        let mut archive = None;
        let mut leftover = None;
        let primary = self
            .archive_and_upload(deadline, &mut stage, &mut archive, &mut leftover)
            .await
            .err();
        let reached = stage;

        // 3. Restore under its own deadline
        let restore_error = self.restore(restore).await.err();
        if restore_error.is_none() {
            advance(&mut stage, Stage::Restored);
        }

        // 4. The archive file goes away on every path
        if let Some(path) = leftover {
            discard_archive(&path).await;
        }

        let error = BackupError::combine(primary, restore_error);
        advance(&mut stage, if error.is_some() { Stage::Failed } else { Stage::Done });

        RunReport {
            stage,
            failed_at: error.as_ref().map(|_| reached),
            archive,
            error,
        }
    }

    async fn archive_and_upload(
        &self,
        deadline: Instant,
        stage: &mut Stage,
        archive: &mut Option<ArchiveArtifact>,
        leftover: &mut Option<PathBuf>,
    ) -> Result<(), BackupError> {
        let directory = &self.settings.backup_directory;
        let archiver = Archiver::new(&self.settings.scratch_directory);

        let span = tracing::info_span!("archive", directory = %directory.display());
        let artifact = match archiver.archive(directory, deadline).instrument(span).await {
            Ok(artifact) => artifact,
            Err(err) => {
                if let BackupError::Archive { archive_path, .. } = &err {
                    *leftover = Some(archive_path.clone());
                }
                tracing::error!(stage = %stage, error = %err, "Failed to archive");
                return Err(err);
            }
        };
        *leftover = Some(artifact.local_path.clone());
        *archive = Some(artifact.clone());
        advance(stage, Stage::Archived);

        let span = tracing::info_span!(
            "upload",
            bucket = %self.settings.upload.bucket,
            name = %artifact.name,
            file = %artifact.local_path.display(),
        );
        if let Err(err) = self.upload(&artifact, deadline).instrument(span).await {
            tracing::error!(stage = %stage, error = %err, "Failed to upload archive");
            return Err(err);
        }
        advance(stage, Stage::Uploaded);

        Ok(())
    }

    async fn upload(&self, artifact: &ArchiveArtifact, deadline: Instant) -> Result<(), BackupError> {
        let upload = &self.settings.upload;
        let upload_error = |cause: anyhow::Error| BackupError::Upload {
            bucket: upload.bucket.clone(),
            key: artifact.name.clone(),
            cause,
        };

        tracing::info!("Uploading archive");

        let file = tokio::fs::File::open(&artifact.local_path)
            .await
            .map_err(|err| upload_error(anyhow::Error::new(err).context("Failed to open archive")))?;
        let mut body = ProgressReader::logging(file, artifact.size_bytes, artifact.name.clone());

        let expires = expiry(upload.archive_lifetime);
        if expires.is_none() && upload.archive_lifetime.is_some_and(|lifetime| !lifetime.is_zero()) {
            tracing::warn!("Archive lifetime is out of range, uploading without expiry");
        }
        let options = PutOptions {
            content_type: ARCHIVE_CONTENT_TYPE.to_string(),
            storage_class: upload.storage_class.clone(),
            expires,
        };

        let put = self.store.put_object(
            &upload.bucket,
            &artifact.name,
            &mut body,
            artifact.size_bytes,
            &options,
        );
        tokio::time::timeout_at(deadline, put)
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("deadline exceeded")))
            .map_err(upload_error)?;

        if body.bytes_moved() != artifact.size_bytes {
            return Err(upload_error(anyhow::anyhow!(
                "store consumed {} of {} bytes",
                body.bytes_moved(),
                artifact.size_bytes
            )));
        }

        tracing::info!("Uploaded archive");
        Ok(())
    }

    async fn restore(&self, action: RestoreAction) -> Result<(), BackupError> {
        let resource = action.workload().to_string();
        let replicas = action.state().desired_replicas;

        match tokio::time::timeout(self.settings.timeouts.restore, action.restore()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Failed to scale up");
                Err(BackupError::Restore(Box::new(err)))
            }
            Err(_) => {
                tracing::error!(replicas, "Timed out scaling up");
                Err(BackupError::Restore(Box::new(BackupError::ScaleWrite {
                    resource,
                    replicas,
                    cause: anyhow::anyhow!("deadline exceeded"),
                })))
            }
        }
    }

    async fn notify(&self, outcome: &RunOutcome) {
        let Some(notifier) = &self.notifier else {
            tracing::debug!("Notifications disabled");
            return;
        };

        tracing::info!("Sending notification");
        if let Err(err) = notifier.notify(outcome).await {
            let err = BackupError::Notify(err);
            tracing::error!(error = %err, "Failed to send notification");
        }
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    tracing::debug!(from = %stage, to = %next, "Stage transition");
    *stage = next;
}

/// `now + lifetime`, or nothing for an unset or zero lifetime or one past the representable range
pub fn expiry(lifetime: Option<Duration>) -> Option<chrono::DateTime<Utc>> {
    let lifetime = lifetime.filter(|lifetime| !lifetime.is_zero())?;
    let lifetime = chrono::Duration::from_std(lifetime).ok()?;
    Utc::now().checked_add_signed(lifetime)
}

async fn discard_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(file = %path.display(), "Deleted temporary archive file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(file = %path.display(), error = %err, "Failed to delete temporary archive file")
        }
    }
}
