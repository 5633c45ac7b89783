use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::health::{HealthCheckResult, HealthCheckSuite};
use crate::logger;
use crate::paths::StorePaths;
use crate::rollback::{RestartRequired, RollbackController, RollbackRecord};

/// A version installed and awaiting (or having passed) its health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAttempt {
    pub from_version: String,
    pub to_version: String,
    pub installed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub version: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Where available versions come from. The download transport lives outside
/// this crate; collaborators hand in an implementation.
pub trait UpdateProvider {
    fn latest(&self) -> Result<Option<UpdateInfo>>;
}

/// Provider backed by a local release manifest file, for collaborators that
/// stage downloads themselves.
pub struct ManifestProvider {
    path: PathBuf,
}

impl ManifestProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl UpdateProvider for ManifestProvider {
    fn latest(&self) -> Result<Option<UpdateInfo>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)?;
        let info: UpdateInfo = serde_json::from_str(&data)?;
        Ok(Some(info))
    }
}

/// Outcome of settling a pending update against its health-check result.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// Checks passed; any pending attempt is recorded as successful.
    Healthy,
    /// Checks failed with a pending attempt; the version was reverted and
    /// the process must restart.
    RolledBack(RollbackRecord, RestartRequired),
    /// Checks failed but there was no pending update to revert.
    Unhealthy,
}

/// Guards application updates: install bumps the version markers, and the
/// first health-check run after restart either confirms the update or rolls
/// it back exactly once.
pub struct UpdateGuard {
    paths: StorePaths,
    rollback: RollbackController,
    pub settings: Settings,
}

impl UpdateGuard {
    pub fn load(paths: StorePaths) -> Result<Self> {
        let settings = Settings::load(&paths)?;
        let rollback = RollbackController::new(paths.clone());
        Ok(Self {
            paths,
            rollback,
            settings,
        })
    }

    /// Newest applicable version, if any. Versions the user rolled back from
    /// are permanently skipped.
    pub fn check_for_update(&self, provider: &dyn UpdateProvider) -> Result<Option<UpdateInfo>> {
        let Some(info) = provider.latest()? else {
            return Ok(None);
        };
        if self.settings.is_skipped(&info.version) {
            logger::debug(&format!("update {} is on the skip list", info.version));
            return Ok(None);
        }
        if parse_version(&info.version)? <= parse_version(&self.settings.installed_version)? {
            return Ok(None);
        }
        Ok(Some(info))
    }

    /// Record the attempt and bump the version markers. Takes effect only
    /// after the caller restarts the process.
    pub fn install_update(&mut self, info: &UpdateInfo) -> Result<RestartRequired> {
        let from = self.settings.installed_version.clone();
        self.settings.pending_update = Some(UpdateAttempt {
            from_version: from.clone(),
            to_version: info.version.clone(),
            installed_at: Utc::now().to_rfc3339(),
        });
        self.settings.previous_version = Some(from);
        self.settings.installed_version = info.version.clone();
        self.settings.save(&self.paths)?;
        Ok(RestartRequired)
    }

    /// Run the post-update suite and settle any pending attempt.
    pub fn run_health_checks(
        &mut self,
        suite: &HealthCheckSuite,
    ) -> Result<(HealthCheckResult, UpdateOutcome)> {
        let result = suite.run()?;
        let outcome = self.settle(&result)?;
        Ok((result, outcome))
    }

    /// Resolve a health-check result against the pending update. Rollback
    /// happens at most once per attempt: it consumes `pending_update`, so a
    /// second settle finds nothing to revert.
    pub fn settle(&mut self, result: &HealthCheckResult) -> Result<UpdateOutcome> {
        if result.passed {
            if let Some(pending) = self.settings.pending_update.take() {
                self.settings.last_successful_update = Some(pending);
                self.settings.save(&self.paths)?;
            }
            return Ok(UpdateOutcome::Healthy);
        }

        if self.settings.pending_update.is_none() {
            return Ok(UpdateOutcome::Unhealthy);
        }

        let reason = result
            .failures
            .iter()
            .find(|f| f.critical)
            .or_else(|| result.failures.first())
            .map(|f| format!("{}: {}", f.check, f.error))
            .unwrap_or_else(|| "health checks failed".to_string());

        let (record, restart) = self.rollback.rollback(&mut self.settings, &reason)?;
        Ok(UpdateOutcome::RolledBack(record, restart))
    }

    /// Manual revert, exposed on the command surface.
    pub fn rollback_to_previous_version(
        &mut self,
        reason: &str,
    ) -> Result<(RollbackRecord, RestartRequired)> {
        self.rollback.rollback(&mut self.settings, reason)
    }

    pub fn check_and_clear_rollback(&self) -> Result<Option<RollbackRecord>> {
        self.rollback.check_and_clear()
    }
}

/// Parse `x.y.z` into a comparable triple.
pub fn parse_version(version: &str) -> Result<(u32, u32, u32)> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::InvalidVersion(version.to_string()));
    }
    let mut nums = [0u32; 3];
    for (slot, part) in nums.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| Error::InvalidVersion(version.to_string()))?;
    }
    Ok((nums[0], nums[1], nums[2]))
}
