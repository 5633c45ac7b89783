//! Safe cutover of a plaintext application store to an encrypted one, with
//! verified rollback of application updates.
//!
//! Two pipelines share this crate:
//!
//! * the migration state machine ([`MigrationController`]): derive a key from
//!   a user secret, snapshot the plaintext store, copy every table into a
//!   SQLCipher destination, verify the copy, and only then let the user decide
//!   the fate of the original;
//! * the update guard ([`UpdateGuard`]): install a new application version
//!   behind a pending marker and let the first post-restart health-check run
//!   either confirm it or roll it back to the previous version.
//!
//! Secret material lives in zeroized buffers and never reaches logs or
//! persisted files; only the key's salt and fingerprint are written out.

pub mod backup;
pub mod config;
pub mod error;
pub mod health;
pub mod keystore;
pub mod logger;
pub mod migration;
pub mod paths;
pub mod retry;
pub mod rollback;
pub mod sanitize;
pub mod security;
pub mod store;
pub mod update;

pub use crate::backup::{BackupService, BackupSnapshot};
pub use crate::config::Settings;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::health::{CheckContext, HealthCheckResult, HealthCheckSuite};
pub use crate::keystore::{Keystore, RecoveryCode};
pub use crate::migration::{
    FinalizeChoice, MigrationController, MigrationProgress, MigrationRecord, Phase,
    VerificationResult,
};
pub use crate::paths::StorePaths;
pub use crate::rollback::{RestartRequired, RollbackRecord};
pub use crate::security::SecretBuf;
pub use crate::update::{ManifestProvider, UpdateGuard, UpdateInfo, UpdateOutcome, UpdateProvider};
