//! In-memory collaborators for tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use snapback_models::{OwnerRef, ReplicaSetRecord, RunOutcome, WorkloadRef, POD_TEMPLATE_HASH_LABEL};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::k8s_client::ClusterApi;
use crate::notify::Notifier;
use crate::storage::{ObjectStore, PutOptions};

#[derive(Default)]
struct ClusterState {
    replicas: i32,
    writes: Vec<i32>,
    fail_reads: bool,
    failing_write: Option<usize>,
    replica_sets: Vec<ReplicaSetRecord>,
    pod_script: VecDeque<Vec<String>>,
    never_terminate: bool,
    failing_lists: usize,
    selectors: Vec<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn with_replicas(replicas: i32) -> Self {
        let cluster = Self::default();
        cluster.state.lock().unwrap().replicas = replicas;
        cluster
    }

    pub fn replicas(&self) -> i32 {
        self.state.lock().unwrap().replicas
    }

    /// Every attempted write, failed ones included
    pub fn writes(&self) -> Vec<i32> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn fail_reads(&self) {
        self.state.lock().unwrap().fail_reads = true;
    }

    /// Make the n-th write (1-based) fail
    pub fn fail_write_number(&self, n: usize) {
        self.state.lock().unwrap().failing_write = Some(n);
    }

    pub fn add_replica_set(&self, name: &str, owner_kind: &str, owner_name: &str, hash: &str) {
        let mut labels = BTreeMap::new();
        labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
        self.state.lock().unwrap().replica_sets.push(ReplicaSetRecord {
            name: name.to_string(),
            labels,
            owners: vec![OwnerRef {
                kind: owner_kind.to_string(),
                name: owner_name.to_string(),
            }],
            revision: Some(1),
        });
    }

    /// Successive answers of `list_pods`; once drained the pod set is empty
    pub fn script_pods(&self, script: Vec<Vec<&str>>) {
        self.state.lock().unwrap().pod_script = script
            .into_iter()
            .map(|pods| pods.into_iter().map(str::to_string).collect())
            .collect();
    }

    pub fn pods_never_terminate(&self) {
        self.state.lock().unwrap().never_terminate = true;
    }

    pub fn fail_pod_lists(&self, count: usize) {
        self.state.lock().unwrap().failing_lists = count;
    }

    pub fn pod_selectors(&self) -> Vec<String> {
        self.state.lock().unwrap().selectors.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_replicas(&self, workload: &WorkloadRef) -> Result<i32> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            bail!("{} not found", workload);
        }
        Ok(state.replicas)
    }

    async fn set_replicas(&self, _workload: &WorkloadRef, replicas: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes.push(replicas);
        if state.failing_write == Some(state.writes.len()) {
            bail!("scale patch rejected");
        }
        state.replicas = replicas;
        Ok(())
    }

    async fn list_replica_sets(&self, _namespace: &str) -> Result<Vec<ReplicaSetRecord>> {
        Ok(self.state.lock().unwrap().replica_sets.clone())
    }

    async fn get_replica_set(&self, _namespace: &str, name: &str) -> Result<ReplicaSetRecord> {
        let state = self.state.lock().unwrap();
        match state.replica_sets.iter().find(|record| record.name == name) {
            Some(record) => Ok(record.clone()),
            None => bail!("replicaset {} not found", name),
        }
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.selectors.push(label_selector.to_string());
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            bail!("etcd leader changed");
        }
        if state.never_terminate {
            return Ok(vec!["stuck-pod".to_string()]);
        }
        Ok(state.pod_script.pop_front().unwrap_or_default())
    }
}

/// An object captured by [`FakeStore`]
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub body: Vec<u8>,
    pub options: PutOptions,
}

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<Vec<StoredObject>>,
    failure: Mutex<Option<String>>,
    read_limit: Option<u64>,
}

impl FakeStore {
    pub fn failing(message: &str) -> Self {
        let store = Self::default();
        *store.failure.lock().unwrap() = Some(message.to_string());
        store
    }

    /// Accept the object after reading only the first `limit` bytes of the body
    pub fn reading_at_most(limit: u64) -> Self {
        Self {
            read_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        options: &PutOptions,
    ) -> Result<()> {
        let mut buf = Vec::new();
        match self.read_limit {
            Some(limit) => (&mut *body).take(limit).read_to_end(&mut buf).await?,
            None => body.read_to_end(&mut buf).await?,
        };

        if let Some(message) = self.failure.lock().unwrap().clone() {
            bail!(message);
        }

        self.objects.lock().unwrap().push(StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            body: buf,
            options: options.clone(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<RunOutcome>>,
    fail: bool,
}

impl FakeNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<RunOutcome> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, outcome: &RunOutcome) -> Result<()> {
        self.sent.lock().unwrap().push(outcome.clone());
        if self.fail {
            bail!("chat not found");
        }
        Ok(())
    }
}
