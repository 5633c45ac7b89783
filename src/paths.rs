use std::path::{Path, PathBuf};

use directories::BaseDirs;

use crate::error::{Error, Result};

/// All on-disk locations used by the migration core. The plaintext source
/// store and the encrypted destination live side by side in the base
/// directory until finalize decides the source's fate.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub base_dir: PathBuf,
    pub source_db: PathBuf,
    pub encrypted_db: PathBuf,
    pub keystore_path: PathBuf,
    pub settings_path: PathBuf,
    pub rollback_path: PathBuf,
    pub backups_dir: PathBuf,
}

impl StorePaths {
    pub fn new(base: Option<&Path>) -> Result<Self> {
        let base_dir = match base {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => std::env::current_dir()?.join(path),
            None => {
                let base_dirs = BaseDirs::new().ok_or_else(|| {
                    Error::Io(std::io::Error::other("unable to resolve home directory"))
                })?;
                base_dirs.home_dir().join(".cutover")
            }
        };

        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            source_db: base_dir.join("app.db"),
            encrypted_db: base_dir.join("app.encrypted.db"),
            keystore_path: base_dir.join("keystore.json"),
            settings_path: base_dir.join("settings.json"),
            rollback_path: base_dir.join("rollback.json"),
            backups_dir: base_dir.join("backups"),
            base_dir,
        })
    }

    pub fn ensure_base_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.base_dir, Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_under_explicit_base() {
        let temp = tempdir().unwrap();
        let paths = StorePaths::new(Some(temp.path())).unwrap();
        assert_eq!(paths.source_db, temp.path().join("app.db"));
        assert_eq!(paths.encrypted_db, temp.path().join("app.encrypted.db"));
        assert!(paths.base_dir.exists());
    }
}
