use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Label shared by a ReplicaSet and the pods it manages
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Annotation the Deployment controller stamps on each ReplicaSet generation
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Content type of every uploaded archive
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

// ============================================================================
// Workload reference
// ============================================================================

/// Kind of a scalable workload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
}

impl WorkloadKind {
    /// Kind as it appears in owner references (`Deployment`)
    pub fn as_kind(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }

    /// Singular lowercase type used in `TYPE/NAME` identifiers
    pub fn as_type(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::ReplicaSet => "replicaset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_kind())
    }
}

impl FromStr for WorkloadKind {
    type Err = WorkloadRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        let singular = lowered.strip_suffix('s').unwrap_or(&lowered);
        match singular {
            "deployment" => Ok(WorkloadKind::Deployment),
            "statefulset" => Ok(WorkloadKind::StatefulSet),
            "replicaset" => Ok(WorkloadKind::ReplicaSet),
            _ => Err(WorkloadRefError::UnknownType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkloadRefError {
    #[error("must be TYPE/NAME, got {0:?}")]
    Malformed(String),
    #[error("TYPE must be deployment(s), statefulset(s) or replicaset(s), got {0:?}")]
    UnknownType(String),
    #[error("NAME must not be empty")]
    EmptyName,
    #[error("namespace must not be empty")]
    EmptyNamespace,
}

/// The workload being quiesced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    /// Parse a `TYPE/NAME` identifier, e.g. `deployments/web` or `StatefulSet/db`
    pub fn parse(id: &str, namespace: &str) -> Result<Self, WorkloadRefError> {
        let (kind, name) = id
            .split_once('/')
            .ok_or_else(|| WorkloadRefError::Malformed(id.to_string()))?;

        let kind = kind.parse::<WorkloadKind>()?;

        if name.is_empty() {
            return Err(WorkloadRefError::EmptyName);
        }
        if name.contains('/') {
            return Err(WorkloadRefError::Malformed(id.to_string()));
        }
        if namespace.is_empty() {
            return Err(WorkloadRefError::EmptyNamespace);
        }

        Ok(Self {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_type(), self.name)
    }
}

// ============================================================================
// Scale state
// ============================================================================

/// Replica count captured right before scaling down
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleState {
    pub desired_replicas: i32,
}

// ============================================================================
// Owner discovery
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// The parts of a ReplicaSet needed to find a workload's pods
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSetRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owners: Vec<OwnerRef>,
    /// Value of the Deployment revision annotation, when present and numeric
    pub revision: Option<i64>,
}

impl ReplicaSetRecord {
    pub fn is_owned_by(&self, workload: &WorkloadRef) -> bool {
        self.owners
            .iter()
            .any(|owner| owner.kind == workload.kind.as_kind() && owner.name == workload.name)
    }

    pub fn pod_template_hash(&self) -> Option<&str> {
        self.labels.get(POD_TEMPLATE_HASH_LABEL).map(String::as_str)
    }
}

// ============================================================================
// Archive
// ============================================================================

/// A compressed snapshot of the backup directory on local disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveArtifact {
    /// File name, also used as the object key
    pub name: String,
    pub local_path: PathBuf,
    /// On-disk size after the compression trailer was written
    pub size_bytes: u64,
}

/// `backup-<RFC3339>.tar.gz` for the given instant
pub fn archive_name(at: DateTime<Utc>) -> String {
    format!(
        "backup-{}.tar.gz",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

// ============================================================================
// Transfer progress
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TransferProgress {
    pub bytes_moved: u64,
    pub total_bytes: u64,
    /// Percentage rounded to two decimals
    pub percent: f64,
}

impl TransferProgress {
    pub fn new(bytes_moved: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            100.0
        } else {
            let raw = bytes_moved as f64 / total_bytes as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        };
        Self {
            bytes_moved,
            total_bytes,
            percent,
        }
    }
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} ({:.2}%)",
            byte_count_iec(self.bytes_moved),
            byte_count_iec(self.total_bytes),
            self.percent
        )
    }
}

// ============================================================================
// Run outcome
// ============================================================================

/// Terminal state of one run, handed to the notifier exactly once
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOutcome {
    /// Canonical `type/name` of the workload
    pub workload: String,
    pub succeeded: bool,
    /// Present only if an archive was produced
    pub archive_size_bytes: Option<u64>,
    /// Combined error text of a failed run
    pub error: Option<String>,
    /// Everything logged during the run
    pub captured_log: String,
}

/// Human readable size in IEC units (`1.5 KiB`)
pub fn byte_count_iec(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}iB",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}
