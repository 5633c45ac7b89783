use std::fs;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::logger;
use crate::paths::StorePaths;

/// Persisted when a failed update is reverted. Surfaced to the user at most
/// once: reading it clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub failed_version: String,
    pub previous_version: String,
    pub rolled_back_at: String,
    pub reason: String,
}

/// Returned by operations after which the running process must not continue;
/// the caller is responsible for forcing an explicit restart.
#[must_use = "the process must be restarted before continuing"]
#[derive(Debug)]
pub struct RestartRequired;

pub struct RollbackController {
    paths: StorePaths,
}

impl RollbackController {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    /// Revert to the previous installed version: restore the version marker,
    /// permanently skip the failed version, and persist the one-shot record.
    pub fn rollback(
        &self,
        settings: &mut Settings,
        reason: &str,
    ) -> Result<(RollbackRecord, RestartRequired)> {
        let previous = settings.previous_version.take().ok_or_else(|| {
            Error::Health("no previous version recorded; cannot roll back".to_string())
        })?;
        let failed = std::mem::replace(&mut settings.installed_version, previous.clone());

        if !settings.is_skipped(&failed) {
            settings.skipped_versions.push(failed.clone());
        }
        settings.pending_update = None;
        settings.save(&self.paths)?;

        let record = RollbackRecord {
            failed_version: failed,
            previous_version: previous,
            rolled_back_at: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
        };
        self.persist_record(&record)?;

        logger::debug(&format!(
            "rolled back {} -> {}",
            record.failed_version, record.previous_version
        ));
        Ok((record, RestartRequired))
    }

    /// One-shot read of the pending record. The file is removed before the
    /// record is returned, so a second call in the same or a later session
    /// gets `None` until another rollback occurs.
    pub fn check_and_clear(&self) -> Result<Option<RollbackRecord>> {
        if !self.paths.rollback_path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.paths.rollback_path)?;
        fs::remove_file(&self.paths.rollback_path)?;

        match serde_json::from_str::<RollbackRecord>(&data) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                logger::error(&format!("discarding unreadable rollback record: {err}"));
                Ok(None)
            }
        }
    }

    fn persist_record(&self, record: &RollbackRecord) -> Result<()> {
        let data = serde_json::to_string_pretty(record)?;
        fs::write(&self.paths.rollback_path, data)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.paths.rollback_path, Permissions::from_mode(0o600));
        }
        Ok(())
    }
}
