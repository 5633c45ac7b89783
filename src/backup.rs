use std::fs;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::logger;
use crate::retry::RetryPolicy;

/// Byte-identical copy of the source store plus its integrity checksum.
/// The source checksum is cached at snapshot time so later phases can prove
/// the source was never touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub path: PathBuf,
    pub source_path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
    pub created_at: String,
}

pub struct BackupService {
    backups_dir: PathBuf,
    retry: RetryPolicy,
}

impl BackupService {
    pub fn new(backups_dir: PathBuf) -> Self {
        Self {
            backups_dir,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(backups_dir: PathBuf, retry: RetryPolicy) -> Self {
        Self { backups_dir, retry }
    }

    /// Snapshot the source store: hash, copy, re-hash the copy, compare.
    /// A mismatching copy is deleted, never left half-written.
    pub fn create_snapshot(&self, source: &Path) -> Result<BackupSnapshot> {
        fs::create_dir_all(&self.backups_dir)?;

        let size_bytes = fs::metadata(source)?.len();
        let source_checksum = self.retried_io("hash source", || sha256_file(source))?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let copy_path = self.backups_dir.join(format!("snapshot_{timestamp}.db"));

        if let Err((attempts, err)) = self.retry.run("copy source", || fs::copy(source, &copy_path))
        {
            let _ = fs::remove_file(&copy_path);
            if err.kind() == std::io::ErrorKind::StorageFull {
                return Err(Error::InsufficientDiskSpace { needed: size_bytes });
            }
            return Err(Error::BackupIo {
                attempts,
                source: err,
            });
        }

        let copy_checksum = self.retried_io("hash copy", || sha256_file(&copy_path))?;
        self.ensure_copy_matches(&source_checksum, copy_checksum, &copy_path)?;

        let snapshot = BackupSnapshot {
            path: copy_path,
            source_path: source.to_path_buf(),
            checksum: source_checksum,
            size_bytes,
            created_at: Utc::now().to_rfc3339(),
        };
        self.write_sidecars(&snapshot)?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&snapshot.path, Permissions::from_mode(0o600));
        }

        Ok(snapshot)
    }

    /// Copy intact and checksum still matching.
    pub fn verify_snapshot(&self, snapshot: &BackupSnapshot) -> Result<bool> {
        if !snapshot.path.exists() {
            return Ok(false);
        }
        let current = sha256_file(&snapshot.path)?;
        Ok(current == snapshot.checksum)
    }

    /// The tamper check for the running migration: the source file must still
    /// hash to the value cached at snapshot time.
    pub fn source_unchanged(&self, snapshot: &BackupSnapshot) -> Result<bool> {
        if !snapshot.source_path.exists() {
            return Ok(false);
        }
        let current = sha256_file(&snapshot.source_path)?;
        Ok(current == snapshot.checksum)
    }

    /// Restore the snapshot over the source path. Disaster path only.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> Result<()> {
        if !self.verify_snapshot(snapshot)? {
            return Err(Error::ChecksumMismatch {
                path: snapshot.path.clone(),
                expected: snapshot.checksum.clone(),
                actual: "snapshot missing or corrupt".to_string(),
            });
        }
        fs::copy(&snapshot.path, &snapshot.source_path)?;
        Ok(())
    }

    /// Securely erase the snapshot copy and its sidecars.
    pub fn discard(&self, snapshot: &BackupSnapshot) -> Result<()> {
        if snapshot.path.exists() {
            secure_delete(&snapshot.path)?;
        }
        let sidecar = snapshot.path.with_extension("sha256");
        if sidecar.exists() {
            let _ = fs::remove_file(&sidecar);
        }
        let metadata = snapshot.path.with_extension("json");
        if metadata.exists() {
            let _ = fs::remove_file(&metadata);
        }
        Ok(())
    }

    /// Snapshots on disk, newest first. Lets a later process invocation pick
    /// up a retained snapshot.
    pub fn list_snapshots(&self) -> Result<Vec<BackupSnapshot>> {
        let mut snapshots = Vec::new();
        if !self.backups_dir.exists() {
            return Ok(snapshots);
        }
        for entry in fs::read_dir(&self.backups_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Ok(data) = fs::read_to_string(&path)
                && let Ok(snapshot) = serde_json::from_str::<BackupSnapshot>(&data)
            {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// A copy that does not hash to the source checksum is deleted on the
    /// spot; a half-written snapshot must never survive on disk.
    fn ensure_copy_matches(&self, expected: &str, actual: String, copy_path: &Path) -> Result<()> {
        if actual == expected {
            return Ok(());
        }
        let _ = secure_delete(copy_path);
        Err(Error::ChecksumMismatch {
            path: copy_path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }

    fn write_sidecars(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let sidecar = snapshot.path.with_extension("sha256");
        fs::write(&sidecar, &snapshot.checksum)?;

        let metadata = snapshot.path.with_extension("json");
        fs::write(&metadata, serde_json::to_string_pretty(snapshot)?)?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&sidecar, Permissions::from_mode(0o600));
            let _ = fs::set_permissions(&metadata, Permissions::from_mode(0o600));
        }
        Ok(())
    }

    fn retried_io<T>(
        &self,
        label: &str,
        op: impl FnMut() -> std::io::Result<T>,
    ) -> Result<T> {
        self.retry
            .run(label, op)
            .map_err(|(attempts, err)| Error::BackupIo {
                attempts,
                source: err,
            })
    }
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let data = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Overwrite with random bytes, then 0xFF, then 0x00, then unlink.
pub fn secure_delete(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)?;
    let file_size = metadata.len() as usize;

    if file_size == 0 {
        fs::remove_file(path)?;
        return Ok(());
    }

    let mut file = fs::OpenOptions::new().write(true).open(path)?;

    let mut random_buffer = vec![0u8; file_size];
    rand::thread_rng().fill_bytes(&mut random_buffer);
    file.write_all(&random_buffer)?;
    file.sync_all()?;

    for fill in [0xFFu8, 0x00u8] {
        let buffer = vec![fill; file_size];
        file.seek(std::io::SeekFrom::Start(0))?;
        file.write_all(&buffer)?;
        file.sync_all()?;
    }

    drop(file);
    fs::remove_file(path)?;
    logger::debug(&format!("securely deleted {}", path.display()));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_roundtrip() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("app.db");
        fs::write(&source, b"pretend database contents").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let snapshot = service.create_snapshot(&source).unwrap();

        assert!(snapshot.path.exists());
        assert_eq!(snapshot.size_bytes, 25);
        assert!(service.verify_snapshot(&snapshot).unwrap());
        assert!(service.source_unchanged(&snapshot).unwrap());

        // Original untouched.
        assert_eq!(fs::read(&source).unwrap(), b"pretend database contents");
    }

    #[test]
    fn test_tampered_copy_fails_verification() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("app.db");
        fs::write(&source, b"contents").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let snapshot = service.create_snapshot(&source).unwrap();

        fs::write(&snapshot.path, b"tampered").unwrap();
        assert!(!service.verify_snapshot(&snapshot).unwrap());
    }

    #[test]
    fn test_mismatching_copy_is_discarded() {
        let temp = tempdir().unwrap();
        let copy = temp.path().join("snapshot_bad.db");
        fs::write(&copy, b"half-written copy").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let actual = sha256_file(&copy).unwrap();
        let err = service
            .ensure_copy_matches("0000000000000000", actual, &copy)
            .unwrap_err();

        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!copy.exists());
    }

    #[test]
    fn test_source_change_detected() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("app.db");
        fs::write(&source, b"contents").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let snapshot = service.create_snapshot(&source).unwrap();

        fs::write(&source, b"mutated behind our back").unwrap();
        assert!(!service.source_unchanged(&snapshot).unwrap());
    }

    #[test]
    fn test_restore_overwrites_mutated_source() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("app.db");
        fs::write(&source, b"original contents").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let snapshot = service.create_snapshot(&source).unwrap();

        fs::write(&source, b"clobbered").unwrap();
        service.restore(&snapshot).unwrap();
        assert_eq!(fs::read(&source).unwrap(), b"original contents");

        // A corrupt snapshot must never be restored.
        fs::write(&snapshot.path, b"rotten").unwrap();
        let err = service.restore(&snapshot).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_discard_removes_all_artifacts() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("app.db");
        fs::write(&source, b"contents").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let snapshot = service.create_snapshot(&source).unwrap();
        service.discard(&snapshot).unwrap();

        assert!(!snapshot.path.exists());
        assert!(!snapshot.path.with_extension("sha256").exists());
        assert!(!snapshot.path.with_extension("json").exists());
    }

    #[test]
    fn test_list_snapshots_newest_first() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("app.db");
        fs::write(&source, b"contents").unwrap();

        let service = BackupService::new(temp.path().join("backups"));
        let first = service.create_snapshot(&source).unwrap();
        let listed = service.list_snapshots().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checksum, first.checksum);
    }

    #[test]
    fn test_missing_source_surfaces_io_error() {
        let temp = tempdir().unwrap();
        let service = BackupService::with_retry(
            temp.path().join("backups"),
            RetryPolicy {
                max_attempts: 2,
                base_delay: std::time::Duration::from_millis(1),
                factor: 2,
            },
        );
        let err = service
            .create_snapshot(&temp.path().join("nope.db"))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
