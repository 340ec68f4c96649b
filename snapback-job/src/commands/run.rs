use std::sync::Arc;

use anyhow::{Context, Result};
use snapback_workflow::storage::S3Store;
use snapback_workflow::{BackupError, BackupWorkflow, KubeCluster, LogCapture, TelegramNotifier};

use crate::config::Config;

/// Run one backup with the configuration from the environment
pub async fn run(capture: LogCapture) -> Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            let err = BackupError::ConfigInvalid(err.0.join("; "));
            tracing::error!(error = %err, "Refusing to start");
            return Err(err.into());
        }
    };

    tracing::info!(
        resource = %config.workload,
        namespace = %config.workload.namespace,
        bucket = %config.s3.bucket,
        "Starting backup"
    );

    let cluster = KubeCluster::connect()
        .await
        .context("Failed to connect to Kubernetes")?;
    let store = S3Store::new(config.s3_settings());

    let mut workflow = BackupWorkflow::new(
        config.workflow_settings(),
        Arc::new(cluster),
        Arc::new(store),
        capture,
    );

    match &config.telegram {
        Some(telegram) => {
            let notifier = TelegramNotifier::new(telegram.bot_token.clone(), telegram.chat_id);
            workflow = workflow.with_notifier(Arc::new(notifier));
        }
        None => tracing::info!("TELEGRAM_BOT_TOKEN not set, notifications disabled"),
    }

    workflow.run().await?;
    Ok(())
}
