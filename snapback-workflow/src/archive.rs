//! Archiver: stream a directory tree into a `.tar.gz` file

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use snapback_models::{archive_name, byte_count_iec, ArchiveArtifact};
use tokio::time::Instant;
use walkdir::WalkDir;

use crate::error::BackupError;

/// How long a cancelled writer gets to close its file before it is abandoned
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Writes timestamped archives into a scratch directory
#[derive(Debug, Clone)]
pub struct Archiver {
    scratch_dir: PathBuf,
}

impl Archiver {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Archive `source` into `backup-<RFC3339>.tar.gz`.
    ///
    /// On failure the error carries the path of the (possibly partial) file;
    /// removing it is up to the caller. Past `deadline` the walk stops at
    /// the next entry.
    pub async fn archive(&self, source: &Path, deadline: Instant) -> Result<ArchiveArtifact, BackupError> {
        let name = archive_name(Utc::now());
        let local_path = self.scratch_dir.join(&name);

        tracing::info!(name = %name, "Creating archive");

        let cancel = Arc::new(AtomicBool::new(false));
        let span = tracing::Span::current();
        let mut task = tokio::task::spawn_blocking({
            let source = source.to_path_buf();
            let dest = local_path.clone();
            let cancel = cancel.clone();
            move || {
                let _entered = span.enter();
                write_archive(&source, &dest, &cancel)
            }
        });

        let waited = tokio::time::timeout_at(deadline, &mut task).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) => {
                // let the writer stop and close the file before reporting
                cancel.store(true, Ordering::Relaxed);
                if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
                    tracing::warn!(file = %local_path.display(), "Archive writer did not stop in time, abandoning it");
                }
                Ok(Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")))
            }
        };

        let size_bytes = joined
            .unwrap_or_else(|join_err| Err(io::Error::other(join_err)))
            .map_err(|cause| BackupError::Archive {
                directory: source.to_path_buf(),
                archive_path: local_path.clone(),
                cause,
            })?;

        tracing::info!(name = %name, size = %byte_count_iec(size_bytes), "Created archive");

        Ok(ArchiveArtifact {
            name,
            local_path,
            size_bytes,
        })
    }
}

/// Write `source` as gzip-compressed tar into `dest`, returning the final file size
pub fn write_archive(source: &Path, dest: &Path, cancel: &AtomicBool) -> io::Result<u64> {
    if !fs::metadata(source)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", source.display()),
        ));
    }

    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        if cancel.load(Ordering::Relaxed) {
            return Err(cancelled());
        }

        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(relative, path)?;
        } else if file_type.is_file() {
            let file = File::open(path)?;
            let metadata = file.metadata()?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&metadata);
            let inner = file.take(metadata.len());
            builder.append_data(&mut header, relative, CancellableReader { inner, cancel })?;
        } else if file_type.is_symlink() {
            builder.append_path_with_name(path, relative)?;
        } else {
            tracing::warn!(path = %path.display(), "Skipping special file");
        }
    }

    // tar trailer, then gzip trailer, then flush the buffer
    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;

    Ok(file.metadata()?.len())
}

/// Not `Interrupted`: `io::copy` retries those
fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "archiving cancelled")
}

/// Fails every read once `cancel` is set, so a large file stops mid-copy
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a AtomicBool,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(cancelled());
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    /// Relative path -> contents (`None` for directories)
    fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|entry| {
                let entry = entry.unwrap();
                let relative = entry.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
                let contents = if entry.file_type().is_dir() {
                    None
                } else {
                    Some(fs::read(entry.path()).unwrap())
                };
                (relative, contents)
            })
            .collect()
    }

    fn extract(archive: &Path, into: &Path) {
        let file = File::open(archive).unwrap();
        tar::Archive::new(GzDecoder::new(file)).unpack(into).unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_reproduces_tree() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();

        fs::write(source.path().join("top.txt"), b"top level").unwrap();
        fs::create_dir_all(source.path().join("data/nested")).unwrap();
        fs::write(source.path().join("data/a.bin"), vec![7u8; 4096]).unwrap();
        fs::write(source.path().join("data/nested/b.json"), br#"{"ok":true}"#).unwrap();
        fs::create_dir(source.path().join("empty")).unwrap();

        let artifact = Archiver::new(scratch.path())
            .archive(source.path(), far_deadline())
            .await
            .unwrap();

        extract(&artifact.local_path, restored.path());
        assert_eq!(snapshot(source.path()), snapshot(restored.path()));
        assert!(restored.path().join("empty").is_dir());
    }

    #[tokio::test]
    async fn test_artifact_reports_final_size() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        fs::write(source.path().join("log.txt"), "line\n".repeat(500)).unwrap();

        let artifact = Archiver::new(scratch.path())
            .archive(source.path(), far_deadline())
            .await
            .unwrap();

        assert!(artifact.name.starts_with("backup-"));
        assert!(artifact.name.ends_with(".tar.gz"));
        assert_eq!(artifact.local_path, scratch.path().join(&artifact.name));
        assert_eq!(artifact.size_bytes, fs::metadata(&artifact.local_path).unwrap().len());
        assert!(artifact.size_bytes > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_kept_as_links() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();
        fs::write(source.path().join("target.txt"), b"payload").unwrap();
        std::os::unix::fs::symlink("target.txt", source.path().join("link")).unwrap();

        let artifact = Archiver::new(scratch.path())
            .archive(source.path(), far_deadline())
            .await
            .unwrap();

        extract(&artifact.local_path, restored.path());
        let link = restored.path().join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target.txt"));
    }

    #[tokio::test]
    async fn test_missing_source_is_archive_error() {
        let scratch = tempfile::tempdir().unwrap();
        let missing = scratch.path().join("does-not-exist");

        let err = Archiver::new(scratch.path())
            .archive(&missing, far_deadline())
            .await
            .err()
            .unwrap();

        match err {
            BackupError::Archive { directory, archive_path, .. } => {
                assert_eq!(directory, missing);
                assert!(archive_path.starts_with(scratch.path()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cancelled_write_stops() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"a").unwrap();

        let cancel = AtomicBool::new(true);
        let err = write_archive(source.path(), &scratch.path().join("x.tar.gz"), &cancel)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_cancel_stops_a_file_mid_copy() {
        let cancel = AtomicBool::new(false);
        let mut reader = CancellableReader {
            inner: io::repeat(1),
            cancel: &cancel,
        };
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 16);

        cancel.store(true, Ordering::Relaxed);
        assert_eq!(reader.read(&mut buf).unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_a_large_file() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();

        // poorly compressible, so gzip alone takes well over a second
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let data: Vec<u8> = (0..96 * 1024 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        fs::write(source.path().join("big.bin"), &data).unwrap();
        drop(data);

        let started = std::time::Instant::now();
        let err = Archiver::new(scratch.path())
            .archive(source.path(), Instant::now() + Duration::from_millis(50))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BackupError::Archive { .. }));
        assert!(started.elapsed() < Duration::from_millis(1500), "took {:?}", started.elapsed());
    }
}
