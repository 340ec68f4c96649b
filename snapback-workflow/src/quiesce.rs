//! Quiesce controller: scale a workload to zero and hand back the action that undoes it

use std::sync::Arc;
use std::time::Duration;

use snapback_models::{ScaleState, WorkloadKind, WorkloadRef, POD_TEMPLATE_HASH_LABEL};
use tokio::time::Instant;

use crate::error::BackupError;
use crate::k8s_client::{find_pod_template_hash, ClusterApi};

/// How long to poll for pod termination and how often
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Scales a workload back to its snapshotted replica count.
///
/// `restore` consumes the action, so it runs at most once.
#[must_use = "a quiesced workload stays at zero replicas unless restored"]
pub struct RestoreAction {
    cluster: Arc<dyn ClusterApi>,
    workload: WorkloadRef,
    state: ScaleState,
    restored: bool,
}

impl RestoreAction {
    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    pub fn state(&self) -> ScaleState {
        self.state
    }

    pub async fn restore(mut self) -> Result<(), BackupError> {
        self.restored = true;
        scale(self.cluster.as_ref(), &self.workload, self.state.desired_replicas).await
    }
}

impl Drop for RestoreAction {
    fn drop(&mut self) {
        if !self.restored {
            tracing::error!(
                resource = %self.workload,
                namespace = %self.workload.namespace,
                replicas = self.state.desired_replicas,
                "Restore action dropped without scaling back up"
            );
        }
    }
}

/// Snapshot the replica count, scale to zero and optionally wait for the pods to go away.
///
/// Waiting is best-effort: a timeout or lookup failure is logged and the
/// restore action is still returned. `deadline` bounds the whole call.
pub async fn quiesce(
    cluster: Arc<dyn ClusterApi>,
    workload: &WorkloadRef,
    wait: Option<WaitOptions>,
    deadline: Instant,
) -> Result<RestoreAction, BackupError> {
    // 1. Snapshot the current scale
    let replicas = read_replicas(cluster.as_ref(), workload, deadline).await?;
    let state = ScaleState {
        desired_replicas: replicas,
    };

    // 2. Scale down
    match tokio::time::timeout_at(deadline, scale(cluster.as_ref(), workload, 0)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(BackupError::ScaleWrite {
                resource: workload.to_string(),
                replicas: 0,
                cause: anyhow::anyhow!("deadline exceeded"),
            })
        }
    }

    let action = RestoreAction {
        cluster: cluster.clone(),
        workload: workload.clone(),
        state,
        restored: false,
    };

    // 3. Optionally wait, never failing the quiesce
    if let Some(options) = wait {
        let wait_deadline = deadline.min(Instant::now() + options.timeout);
        if let Err(err) = wait_for_termination(cluster.as_ref(), workload, options, wait_deadline).await {
            tracing::warn!(error = %err, "Failed to wait for pods to terminate");
        }
    }

    Ok(action)
}

async fn read_replicas(
    cluster: &dyn ClusterApi,
    workload: &WorkloadRef,
    deadline: Instant,
) -> Result<i32, BackupError> {
    tracing::info!("Trying to get current number of replicas");

    let replicas = tokio::time::timeout_at(deadline, cluster.get_replicas(workload))
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("deadline exceeded")))
        .map_err(|cause| BackupError::ScaleRead {
            resource: workload.to_string(),
            cause,
        })?;

    tracing::info!(count = replicas, "Got number of replicas");
    Ok(replicas)
}

async fn scale(cluster: &dyn ClusterApi, workload: &WorkloadRef, replicas: i32) -> Result<(), BackupError> {
    tracing::info!("Trying to scale to {}", replicas);

    cluster
        .set_replicas(workload, replicas)
        .await
        .map_err(|cause| BackupError::ScaleWrite {
            resource: workload.to_string(),
            replicas,
            cause,
        })?;

    tracing::info!("Successfully scaled to {}", replicas);
    Ok(())
}

/// Resolve the label selecting the workload's pods
async fn pod_selector(cluster: &dyn ClusterApi, workload: &WorkloadRef) -> anyhow::Result<String> {
    tracing::info!("Trying to get pod template hash");

    let hash = match workload.kind {
        WorkloadKind::ReplicaSet => cluster
            .get_replica_set(&workload.namespace, &workload.name)
            .await?
            .pod_template_hash()
            .map(str::to_string),
        WorkloadKind::Deployment | WorkloadKind::StatefulSet => {
            let records = cluster.list_replica_sets(&workload.namespace).await?;
            find_pod_template_hash(&records, workload)
        }
    };

    let hash = hash.ok_or_else(|| {
        anyhow::anyhow!("no ReplicaSet of {} carries a {} label", workload, POD_TEMPLATE_HASH_LABEL)
    })?;

    tracing::info!(hash = %hash, "Got pod template hash");
    Ok(format!("{}={}", POD_TEMPLATE_HASH_LABEL, hash))
}

async fn wait_for_termination(
    cluster: &dyn ClusterApi,
    workload: &WorkloadRef,
    options: WaitOptions,
    deadline: Instant,
) -> Result<(), BackupError> {
    tracing::info!("Waiting for pods to terminate");
    let started = Instant::now();

    let timed_out = || BackupError::WaitTimeout {
        resource: workload.to_string(),
        waited: started.elapsed(),
    };

    let selector = match tokio::time::timeout_at(deadline, pod_selector(cluster, workload)).await {
        Ok(Ok(selector)) => selector,
        Ok(Err(err)) => {
            tracing::warn!(error = %format!("{:#}", err), "Failed to get pod template hash, not waiting");
            return Ok(());
        }
        Err(_) => return Err(timed_out()),
    };

    loop {
        match tokio::time::timeout_at(deadline, cluster.list_pods(&workload.namespace, &selector)).await {
            Ok(Ok(pods)) if pods.is_empty() => break,
            Ok(Ok(pods)) => tracing::info!(remaining = pods.len(), "Pods still running"),
            Ok(Err(err)) => tracing::warn!(error = %format!("{:#}", err), "Failed to list pods, retrying"),
            Err(_) => return Err(timed_out()),
        }

        if Instant::now() + options.poll_interval > deadline {
            return Err(timed_out());
        }
        tokio::time::sleep(options.poll_interval).await;
    }

    tracing::info!("Pods have terminated");
    Ok(())
}
