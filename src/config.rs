use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths::StorePaths;
use crate::update::UpdateAttempt;

/// Plain persisted settings: version markers and the skip list consulted by
/// update checks. No secret material ever lands here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub installed_version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    #[serde(default)]
    pub skipped_versions: Vec<String>,
    /// Set by `install_update`, resolved by the first health-check run after
    /// restart.
    #[serde(default)]
    pub pending_update: Option<UpdateAttempt>,
    #[serde(default)]
    pub last_successful_update: Option<UpdateAttempt>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            installed_version: env!("CARGO_PKG_VERSION").to_string(),
            previous_version: None,
            skipped_versions: Vec::new(),
            pending_update: None,
            last_successful_update: None,
        }
    }
}

impl Settings {
    pub fn load(paths: &StorePaths) -> Result<Self> {
        if !paths.settings_path.exists() {
            return Ok(Settings::default());
        }
        let data = fs::read_to_string(&paths.settings_path)?;
        let settings: Settings = serde_json::from_str(&data).unwrap_or_default();
        Ok(settings)
    }

    pub fn save(&self, paths: &StorePaths) -> Result<()> {
        if let Some(parent) = paths.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&paths.settings_path, data)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&paths.settings_path, Permissions::from_mode(0o600));
        }
        Ok(())
    }

    pub fn is_skipped(&self, version: &str) -> bool {
        self.skipped_versions.iter().any(|v| v == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_missing() {
        let temp = tempdir().unwrap();
        let paths = StorePaths::new(Some(temp.path())).unwrap();
        let settings = Settings::load(&paths).unwrap();
        assert_eq!(settings.installed_version, env!("CARGO_PKG_VERSION"));
        assert!(settings.skipped_versions.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = tempdir().unwrap();
        let paths = StorePaths::new(Some(temp.path())).unwrap();

        let mut settings = Settings::default();
        settings.installed_version = "2.0.0".to_string();
        settings.previous_version = Some("1.1.0".to_string());
        settings.skipped_versions.push("1.9.9".to_string());
        settings.save(&paths).unwrap();

        let loaded = Settings::load(&paths).unwrap();
        assert_eq!(loaded.installed_version, "2.0.0");
        assert_eq!(loaded.previous_version.as_deref(), Some("1.1.0"));
        assert!(loaded.is_skipped("1.9.9"));
        assert!(!loaded.is_skipped("2.0.0"));
    }
}
