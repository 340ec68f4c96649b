//! Error kinds of a backup run

use std::path::PathBuf;
use std::time::Duration;

/// Every way a backup run can go wrong.
///
/// `WaitTimeout` and `Notify` are reported but never fail a run. `Restore`
/// and `Combined` mean the workload may still be scaled to zero.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("failed to get current number of replicas of {resource}: {cause:#}")]
    ScaleRead {
        resource: String,
        cause: anyhow::Error,
    },

    #[error("failed to scale {resource} to {replicas}: {cause:#}")]
    ScaleWrite {
        resource: String,
        replicas: i32,
        cause: anyhow::Error,
    },

    #[error("pods of {resource} did not terminate within {waited:?}")]
    WaitTimeout { resource: String, waited: Duration },

    #[error("failed to archive {directory} into {archive_path}: {cause}")]
    Archive {
        directory: PathBuf,
        archive_path: PathBuf,
        cause: std::io::Error,
    },

    #[error("failed to upload {key} to bucket {bucket}: {cause:#}")]
    Upload {
        bucket: String,
        key: String,
        cause: anyhow::Error,
    },

    #[error("failed to scale up, workload may still be at zero replicas: {0}")]
    Restore(Box<BackupError>),

    #[error("{primary}; additionally {restore}")]
    Combined {
        primary: Box<BackupError>,
        restore: Box<BackupError>,
    },

    #[error("failed to send notification: {0:#}")]
    Notify(anyhow::Error),
}

impl BackupError {
    /// Merge the main-path error with the restore-path error so that neither is lost
    pub fn combine(primary: Option<BackupError>, restore: Option<BackupError>) -> Option<BackupError> {
        match (primary, restore) {
            (Some(primary), Some(restore)) => Some(BackupError::Combined {
                primary: Box::new(primary),
                restore: Box::new(restore),
            }),
            (Some(err), None) | (None, Some(err)) => Some(err),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_error() -> BackupError {
        BackupError::Upload {
            bucket: "backups".to_string(),
            key: "backup-x.tar.gz".to_string(),
            cause: anyhow::anyhow!("connection reset"),
        }
    }

    fn restore_error() -> BackupError {
        BackupError::Restore(Box::new(BackupError::ScaleWrite {
            resource: "deployment/web".to_string(),
            replicas: 3,
            cause: anyhow::anyhow!("forbidden"),
        }))
    }

    #[test]
    fn test_combine_keeps_both_causes() {
        let combined = BackupError::combine(Some(upload_error()), Some(restore_error())).unwrap();
        let text = combined.to_string();
        assert!(text.contains("failed to upload"), "{}", text);
        assert!(text.contains("connection reset"), "{}", text);
        assert!(text.contains("failed to scale up"), "{}", text);
        assert!(text.contains("forbidden"), "{}", text);
    }

    #[test]
    fn test_combine_with_single_error() {
        let only_primary = BackupError::combine(Some(upload_error()), None).unwrap();
        assert!(matches!(only_primary, BackupError::Upload { .. }));

        let only_restore = BackupError::combine(None, Some(restore_error())).unwrap();
        assert!(matches!(only_restore, BackupError::Restore(_)));

        assert!(BackupError::combine(None, None).is_none());
    }
}
