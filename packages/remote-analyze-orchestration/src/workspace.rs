//! Per-job directories on the server
//!
//! ```text
//! <root>/<job_id>/part_<n>.zip    stored bundle of part n
//! <root>/<job_id>/part_<n>/       scratch tree the worker analyzes
//! <root>/<job_id>/output.zip      aggregated result archive
//! ```

use remote_analyze_storage::JobId;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn part_archive(&self, id: &JobId, part: u64) -> PathBuf {
        self.job_dir(id).join(format!("part_{}.zip", part))
    }

    pub fn part_dir(&self, id: &JobId, part: u64) -> PathBuf {
        self.job_dir(id).join(format!("part_{}", part))
    }

    pub fn output_archive(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("output.zip")
    }

    /// Create the job directory
    ///
    /// Returns `false` if it already exists; a directory is never reused.
    pub async fn create_job_dir(&self, id: &JobId) -> io::Result<bool> {
        match tokio::fs::create_dir(self.job_dir(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Write `bytes` to `path` so readers see either nothing or the whole file
///
/// The data goes to a sibling temp file that is synced and then renamed over
/// `path`. A failed write leaves no file at `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let ws = Workspace::new("/srv/jobs");
        let id = JobId::parse("abc").unwrap();

        assert_eq!(ws.job_dir(&id), PathBuf::from("/srv/jobs/abc"));
        assert_eq!(ws.part_archive(&id, 2), PathBuf::from("/srv/jobs/abc/part_2.zip"));
        assert_eq!(ws.part_dir(&id, 2), PathBuf::from("/srv/jobs/abc/part_2"));
        assert_eq!(ws.output_archive(&id), PathBuf::from("/srv/jobs/abc/output.zip"));
    }

    #[tokio::test]
    async fn test_job_dir_is_never_reused() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let id = JobId::generate();

        assert!(ws.create_job_dir(&id).await.unwrap());
        assert!(!ws.create_job_dir(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part_1.zip");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_write_atomic_missing_parent_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone").join("part_1.zip");

        assert!(write_atomic(&path, b"x").await.is_err());
        assert!(!path.exists());
    }
}
