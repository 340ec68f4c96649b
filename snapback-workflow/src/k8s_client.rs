//! Kubernetes client utilities: the scale subresource, pod listing and
//! ReplicaSet owner discovery

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use snapback_models::{
    OwnerRef, ReplicaSetRecord, WorkloadKind, WorkloadRef, REVISION_ANNOTATION,
};
use std::fmt::Debug;

/// Control-plane operations a backup run needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Desired replicas from the scale subresource
    async fn get_replicas(&self, workload: &WorkloadRef) -> Result<i32>;

    /// Set desired replicas through the scale subresource
    async fn set_replicas(&self, workload: &WorkloadRef, replicas: i32) -> Result<()>;

    async fn list_replica_sets(&self, namespace: &str) -> Result<Vec<ReplicaSetRecord>>;

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSetRecord>;

    /// Names of the pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>>;
}

/// Get a Kubernetes client
pub async fn get_k8s_client() -> Result<Client> {
    Client::try_default()
        .await
        .context("Failed to create Kubernetes client")
}

/// [`ClusterApi`] backed by a live cluster
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect() -> Result<Self> {
        Ok(Self::new(get_k8s_client().await?))
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn read_scale<K>(api: Api<K>, name: &str) -> Result<i32>
where
    K: Clone + DeserializeOwned + Debug,
{
    let scale = api.get_scale(name).await?;
    Ok(scale.spec.and_then(|spec| spec.replicas).unwrap_or(0))
}

async fn write_scale<K>(api: Api<K>, name: &str, replicas: i32) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({ "spec": { "replicas": replicas } });
    api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_replicas(&self, workload: &WorkloadRef) -> Result<i32> {
        let ns = &workload.namespace;
        let replicas = match workload.kind {
            WorkloadKind::Deployment => read_scale(self.api::<Deployment>(ns), &workload.name).await,
            WorkloadKind::StatefulSet => read_scale(self.api::<StatefulSet>(ns), &workload.name).await,
            WorkloadKind::ReplicaSet => read_scale(self.api::<ReplicaSet>(ns), &workload.name).await,
        };
        replicas.with_context(|| format!("Failed to get scale of {}", workload))
    }

    async fn set_replicas(&self, workload: &WorkloadRef, replicas: i32) -> Result<()> {
        let ns = &workload.namespace;
        let result = match workload.kind {
            WorkloadKind::Deployment => write_scale(self.api::<Deployment>(ns), &workload.name, replicas).await,
            WorkloadKind::StatefulSet => write_scale(self.api::<StatefulSet>(ns), &workload.name, replicas).await,
            WorkloadKind::ReplicaSet => write_scale(self.api::<ReplicaSet>(ns), &workload.name, replicas).await,
        };
        result.with_context(|| format!("Failed to patch scale of {}", workload))
    }

    async fn list_replica_sets(&self, namespace: &str) -> Result<Vec<ReplicaSetRecord>> {
        let replica_sets = self
            .api::<ReplicaSet>(namespace)
            .list(&ListParams::default())
            .await
            .context("Failed to list replicasets")?;

        Ok(replica_sets.items.iter().map(to_record).collect())
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSetRecord> {
        let replica_set = self
            .api::<ReplicaSet>(namespace)
            .get(name)
            .await
            .with_context(|| format!("Failed to get replicaset {}", name))?;

        Ok(to_record(&replica_set))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>> {
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .context("Failed to list pods")?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }
}

fn to_record(replica_set: &ReplicaSet) -> ReplicaSetRecord {
    let metadata = &replica_set.metadata;
    ReplicaSetRecord {
        name: metadata.name.clone().unwrap_or_default(),
        labels: metadata.labels.clone().unwrap_or_default(),
        owners: metadata
            .owner_references
            .iter()
            .flatten()
            .map(|owner| OwnerRef {
                kind: owner.kind.clone(),
                name: owner.name.clone(),
            })
            .collect(),
        revision: metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(REVISION_ANNOTATION))
            .and_then(|revision| revision.parse().ok()),
    }
}

/// Find the pod-template-hash of the ReplicaSet owned by `workload`.
///
/// Among several owned generations the highest revision wins; records
/// without a revision lose to any record that has one.
pub fn find_pod_template_hash(records: &[ReplicaSetRecord], workload: &WorkloadRef) -> Option<String> {
    records
        .iter()
        .filter(|record| record.is_owned_by(workload))
        .filter(|record| record.pod_template_hash().is_some())
        .max_by_key(|record| record.revision)
        .and_then(|record| record.pod_template_hash())
        .map(str::to_string)
}
