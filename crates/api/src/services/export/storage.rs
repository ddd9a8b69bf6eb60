//! Artifact storage.
//!
//! Generated files are written to `<root>/.staging/` and only become
//! visible under `<root>/` through an atomic rename in [`ArtifactStorage::commit`].
//! A [`StagedArtifact`] deletes its file when dropped, so every abort path
//! (error, cancellation, panic) discards partial output. Files orphaned by a
//! process crash are removed by [`ArtifactStorage::clean_staging`] at startup.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use domain::models::ExportFormat;
use domain::services::StoredArtifact;
use shared::crypto::DigestWriter;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::writers::WriteReceipt;

const STAGING_DIR: &str = ".staging";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact reference: {0}")]
    InvalidRef(String),
}

/// A partially written artifact, invisible to downloads.
pub struct StagedArtifact {
    file: NamedTempFile,
    artifact_ref: String,
}

impl StagedArtifact {
    /// A second handle to the staged file for the format writer.
    pub fn writer_file(&self) -> Result<File, StorageError> {
        Ok(self.file.as_file().try_clone()?)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Name the artifact will be published under.
    pub fn artifact_ref(&self) -> &str {
        &self.artifact_ref
    }
}

/// Filesystem content area for export artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
    staging: PathBuf,
}

impl ArtifactStorage {
    /// Open (creating if needed) the content area at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        Ok(Self { root, staging })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begin a new artifact for `task_id`.
    pub fn stage(&self, task_id: Uuid, format: ExportFormat) -> Result<StagedArtifact, StorageError> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", task_id))
            .suffix(".part")
            .tempfile_in(&self.staging)?;

        Ok(StagedArtifact {
            file,
            artifact_ref: format!("{}.{}", task_id, format.extension()),
        })
    }

    /// Publish a staged artifact.
    ///
    /// Requires the writer's receipt, so only finalized output can be
    /// published. Size and digest are taken from one read of the finished
    /// file: the workbook writer seeks back to patch zip headers, so bytes
    /// seen while writing are not the bytes on disk.
    pub fn commit(
        &self,
        staged: StagedArtifact,
        receipt: WriteReceipt,
    ) -> Result<StoredArtifact, StorageError> {
        let mut reader = staged.file.reopen()?;
        let mut digest = DigestWriter::new(io::sink());
        io::copy(&mut reader, &mut digest)?;

        let target = self.resolve(&staged.artifact_ref)?;
        staged.file.as_file().sync_all()?;
        staged
            .file
            .persist(&target)
            .map_err(|e| StorageError::Io(e.error))?;

        debug!(
            artifact_ref = %staged.artifact_ref,
            rows = receipt.rows,
            bytes = digest.bytes_written(),
            "Artifact committed"
        );

        Ok(StoredArtifact {
            artifact_ref: staged.artifact_ref,
            bytes: digest.bytes_written() as i64,
            sha256: digest.digest_hex(),
        })
    }

    /// Open a committed artifact for streaming.
    pub async fn open(&self, artifact_ref: &str) -> Result<(tokio::fs::File, u64), StorageError> {
        let path = self.resolve(artifact_ref)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(artifact_ref.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Delete a committed artifact. Returns `false` if it was already gone.
    pub fn delete(&self, artifact_ref: &str) -> Result<bool, StorageError> {
        let path = self.resolve(artifact_ref)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, artifact_ref: &str) -> bool {
        self.resolve(artifact_ref)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Remove partial files left behind by a previous process.
    pub fn clean_staging(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.staging)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to remove stale staging file"
                ),
            }
        }
        Ok(removed)
    }

    /// Map an artifact reference to a path inside the content area.
    ///
    /// References are bare file names; anything that could escape the
    /// root is rejected.
    fn resolve(&self, artifact_ref: &str) -> Result<PathBuf, StorageError> {
        let valid = !artifact_ref.is_empty()
            && !artifact_ref.starts_with('.')
            && artifact_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StorageError::InvalidRef(artifact_ref.to_string()));
        }
        Ok(self.root.join(artifact_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn storage() -> (tempfile::TempDir, ArtifactStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path().join("exports")).unwrap();
        (dir, storage)
    }

    fn staging_entries(storage: &ArtifactStorage) -> usize {
        fs::read_dir(storage.root().join(STAGING_DIR)).unwrap().count()
    }

    #[test]
    fn test_staged_file_is_invisible_until_commit() {
        let (_dir, storage) = storage();
        let task_id = Uuid::new_v4();
        let staged = storage.stage(task_id, ExportFormat::Csv).unwrap();
        let artifact_ref = staged.artifact_ref().to_string();
        assert_eq!(artifact_ref, format!("{}.csv", task_id));

        let mut file = staged.writer_file().unwrap();
        file.write_all(b"id\r\n").unwrap();
        assert!(!storage.exists(&artifact_ref));

        let stored = storage.commit(staged, WriteReceipt { rows: 0 }).unwrap();
        assert!(storage.exists(&artifact_ref));
        assert_eq!(stored.bytes, 4);
        assert_eq!(stored.sha256, shared::crypto::sha256_hex(b"id\r\n"));
        assert_eq!(staging_entries(&storage), 0);
    }

    #[test]
    fn test_dropping_staged_artifact_discards_partial_file() {
        let (_dir, storage) = storage();
        let staged = storage.stage(Uuid::new_v4(), ExportFormat::Json).unwrap();
        staged.writer_file().unwrap().write_all(b"[").unwrap();
        let artifact_ref = staged.artifact_ref().to_string();
        assert_eq!(staging_entries(&storage), 1);

        drop(staged);
        assert_eq!(staging_entries(&storage), 0);
        assert!(!storage.exists(&artifact_ref));
    }

    #[test]
    fn test_clean_staging_removes_orphans() {
        let (_dir, storage) = storage();
        let staging = storage.root().join(STAGING_DIR);
        fs::write(staging.join("orphan.part"), b"partial").unwrap();
        fs::write(staging.join("other.part"), b"partial").unwrap();

        assert_eq!(storage.clean_staging().unwrap(), 2);
        assert_eq!(staging_entries(&storage), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, storage) = storage();
        let staged = storage.stage(Uuid::new_v4(), ExportFormat::Csv).unwrap();
        let stored = storage.commit(staged, WriteReceipt { rows: 0 }).unwrap();

        assert!(storage.delete(&stored.artifact_ref).unwrap());
        assert!(!storage.delete(&stored.artifact_ref).unwrap());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let (_dir, storage) = storage();
        for bad in ["", "../etc/passwd", "a/b.csv", ".staging", "..", "x\\y.csv"] {
            assert!(
                matches!(storage.delete(bad), Err(StorageError::InvalidRef(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_workbook_digest_matches_bytes_on_disk() {
        use crate::services::export::writers::{test_support, writer_for};

        let (_dir, storage) = storage();
        let staged = storage.stage(Uuid::new_v4(), ExportFormat::Xlsx).unwrap();
        let mut writer = writer_for(ExportFormat::Xlsx, staged.writer_file().unwrap()).unwrap();
        writer.write_header(&test_support::fields()).unwrap();
        writer.write_row(&test_support::row("Acme", Some(1))).unwrap();
        let receipt = writer.finalize().unwrap();
        drop(writer);

        let stored = storage.commit(staged, receipt).unwrap();
        let on_disk = fs::read(storage.root().join(&stored.artifact_ref)).unwrap();
        assert_eq!(stored.bytes, on_disk.len() as i64);
        assert_eq!(stored.sha256, shared::crypto::sha256_hex(&on_disk));
    }

    #[tokio::test]
    async fn test_open_missing_artifact_is_not_found() {
        let (_dir, storage) = storage();
        let result = storage.open("missing.csv").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_reports_length() {
        let (_dir, storage) = storage();
        let staged = storage.stage(Uuid::new_v4(), ExportFormat::Csv).unwrap();
        staged.writer_file().unwrap().write_all(b"abc").unwrap();
        let stored = storage.commit(staged, WriteReceipt { rows: 0 }).unwrap();

        let (_file, len) = storage.open(&stored.artifact_ref).await.unwrap();
        assert_eq!(len, 3);
    }
}
