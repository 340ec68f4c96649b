//! Snapback Workflow - quiesce a workload, archive its directory, upload, restore
//!
//! This crate holds the backup run itself and the thin bindings to the
//! cluster, object storage and the notification channel.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use snapback_workflow::{BackupWorkflow, KubeCluster, LogCapture, WorkflowSettings};
//! use snapback_workflow::storage::{S3Settings, S3Store};
//!
//! # async fn example(settings: WorkflowSettings, s3: S3Settings) -> anyhow::Result<()> {
//! let cluster = Arc::new(KubeCluster::connect().await?);
//! let store = Arc::new(S3Store::new(s3));
//! let workflow = BackupWorkflow::new(settings, cluster, store, LogCapture::new());
//!
//! let archive = workflow.run().await?;
//! println!("uploaded {}", archive.name);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod error;
pub mod k8s_client;
pub mod log_capture;
pub mod notify;
pub mod progress;
pub mod quiesce;
pub mod storage;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use error::BackupError;
pub use k8s_client::{ClusterApi, KubeCluster};
pub use log_capture::LogCapture;
pub use notify::{Notifier, TelegramNotifier};
pub use quiesce::{RestoreAction, WaitOptions};
pub use storage::{ObjectStore, PutOptions};
pub use workflow::{BackupWorkflow, Stage, Timeouts, UploadSettings, WorkflowSettings};
