use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use crate::backup::{self, BackupService, BackupSnapshot};
use crate::error::{Error, Result};
use crate::keystore::{Keystore, RecoveryCode};
use crate::logger;
use crate::migration::{ProgressReceiver, ProgressSender, engine, verify};
use crate::migration::engine::MigrationRecord;
use crate::migration::verify::VerificationResult;
use crate::paths::StorePaths;
use crate::security::{self, KeySet, SecretBuf};
use crate::store::SourceStore;

/// Exactly one controller may be in a non-idle phase per process.
static ACTIVE_MIGRATION: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RecoveryOptions,
    Backup,
    Migrating,
    Verifying,
    Complete,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::RecoveryOptions => "RecoveryOptions",
            Phase::Backup => "Backup",
            Phase::Migrating => "Migrating",
            Phase::Verifying => "Verifying",
            Phase::Complete => "Complete",
            Phase::Failed => "Failed",
        }
    }
}

/// The user's terminal decision after successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeChoice {
    /// Securely erase the plaintext source and its backup snapshot.
    DeleteOriginal,
    /// Retain both the plaintext source and the encrypted store.
    KeepBoth,
}

/// Owner of the migration state machine. Sequences key derivation, backup,
/// migration, and verification; every transition is validated and illegal
/// calls are rejected, never silently ignored.
pub struct MigrationController {
    paths: StorePaths,
    backup: BackupService,
    phase: Phase,
    keys: Option<KeySet>,
    snapshot: Option<BackupSnapshot>,
    record: Option<MigrationRecord>,
    verification: Option<VerificationResult>,
    progress: Option<ProgressSender>,
    holds_guard: bool,
}

impl MigrationController {
    pub fn new(paths: StorePaths) -> Self {
        let backup = BackupService::new(paths.backups_dir.clone());
        Self {
            paths,
            backup,
            phase: Phase::Idle,
            keys: None,
            snapshot: None,
            record: None,
            verification: None,
            progress: None,
            holds_guard: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Subscribe to per-table progress events for the migration phase.
    pub fn subscribe(&mut self) -> ProgressReceiver {
        let (tx, rx) = mpsc::channel();
        self.progress = Some(tx);
        rx
    }

    /// Derive the encryption key from the user secret and persist its salt
    /// and fingerprint. `Idle -> RecoveryOptions`.
    pub fn setup_secret(&mut self, secret: SecretBuf) -> Result<String> {
        self.expect_phase(Phase::Idle, "setup_secret")?;
        self.acquire_guard()?;

        // The key set is established once per device; replacing it on a
        // store that already migrated is an explicit re-key flow, not a
        // side effect of starting over.
        if self.paths.keystore_path.exists() && self.paths.encrypted_db.exists() {
            self.release_guard();
            return Err(Error::CryptoFailure(
                "an encrypted store already exists for this keystore; re-keying is not supported"
                    .to_string(),
            ));
        }
        if self.paths.keystore_path.exists() {
            logger::debug("replacing keystore left by an abandoned migration");
        }

        let keys = match security::derive_key(&secret) {
            Ok(keys) => keys,
            Err(err) => {
                self.release_guard();
                return Err(err);
            }
        };
        drop(secret);

        let keystore = Keystore::from_key_set(&keys);
        if let Err(err) = keystore.save(&self.paths.keystore_path) {
            self.release_guard();
            return Err(err);
        }

        let fingerprint = keys.fingerprint.clone();
        self.keys = Some(keys);
        self.phase = Phase::RecoveryOptions;
        logger::debug(&format!("key established, fingerprint {fingerprint}"));
        Ok(fingerprint)
    }

    /// Wrap the store key under a fresh recovery mnemonic. Only offered in
    /// the freely-cancellable pre-backup phase.
    pub fn generate_recovery_secret(&mut self) -> Result<RecoveryCode> {
        self.expect_phase(Phase::RecoveryOptions, "generate_recovery_secret")?;
        if !self.paths.keystore_path.exists() {
            return Err(Error::RecoveryUnavailable);
        }
        let keys = self.keys.as_ref().ok_or(Error::RecoveryUnavailable)?;

        let mut keystore = Keystore::load(&self.paths.keystore_path)?;
        let code = keystore.attach_recovery(keys)?;
        keystore.save(&self.paths.keystore_path)?;
        Ok(code)
    }

    /// Abandon before anything destructive has happened.
    /// `RecoveryOptions -> Idle`; the only phase where cancel is legal.
    pub fn cancel(&mut self) -> Result<()> {
        self.expect_phase(Phase::RecoveryOptions, "cancel")?;
        self.keys = None;
        self.phase = Phase::Idle;
        self.release_guard();
        Ok(())
    }

    /// Snapshot the source store. `RecoveryOptions -> Backup`.
    pub fn create_backup(&mut self) -> Result<BackupSnapshot> {
        match self.phase {
            Phase::RecoveryOptions => {}
            // After retry() the controller sits in Backup; a fresh snapshot
            // is allowed if the preserved one was lost.
            Phase::Backup if self.snapshot.is_none() => {}
            _ => {
                return Err(Error::IllegalTransition {
                    phase: self.phase.as_str(),
                    op: "create_backup",
                });
            }
        }

        match self.backup.create_snapshot(&self.paths.source_db) {
            Ok(snapshot) => {
                self.snapshot = Some(snapshot.clone());
                self.phase = Phase::Backup;
                Ok(snapshot)
            }
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    /// Run the all-or-nothing migration. `Backup -> Migrating`, then
    /// `-> Verifying` on success or `-> Failed` on any table failure.
    pub fn migrate_database(&mut self, key_fingerprint: &str) -> Result<MigrationRecord> {
        self.expect_phase(Phase::Backup, "migrate_database")?;
        let keys = self.keys.clone().ok_or(Error::IllegalTransition {
            phase: "Backup",
            op: "migrate_database without a derived key",
        })?;
        if keys.fingerprint != key_fingerprint {
            return Err(Error::CryptoFailure(
                "key fingerprint does not match the active key".to_string(),
            ));
        }
        let snapshot = self.snapshot.as_ref().ok_or(Error::IllegalTransition {
            phase: "Backup",
            op: "migrate_database without a snapshot",
        })?;

        // The source must still hash to the value cached at snapshot time.
        if !self.backup.source_unchanged(snapshot)? {
            let err = Error::ChecksumMismatch {
                path: self.paths.source_db.clone(),
                expected: snapshot.checksum.clone(),
                actual: backup::sha256_file(&self.paths.source_db)
                    .unwrap_or_else(|_| "source missing".to_string()),
            };
            self.phase = Phase::Failed;
            return Err(err);
        }

        self.phase = Phase::Migrating;
        let source = match SourceStore::open_read_only(&self.paths.source_db) {
            Ok(source) => source,
            Err(err) => {
                self.phase = Phase::Failed;
                return Err(err);
            }
        };

        match engine::migrate(
            &source,
            &self.paths.encrypted_db,
            &keys,
            self.progress.as_ref(),
        ) {
            Ok(record) => {
                self.record = Some(record.clone());
                self.phase = Phase::Verifying;
                Ok(record)
            }
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    /// Run the verification gate. A negative result discards the destination
    /// and moves to `Failed` for retry; the snapshot is preserved.
    pub fn verify_migration(&mut self) -> Result<VerificationResult> {
        self.expect_phase(Phase::Verifying, "verify_migration")?;
        let keys = self.keys.clone().ok_or(Error::IllegalTransition {
            phase: "Verifying",
            op: "verify_migration without a derived key",
        })?;

        // An error here must not strand the controller in Verifying; the
        // failure path has to stay reachable for retry().
        let result = match SourceStore::open_read_only(&self.paths.source_db)
            .and_then(|source| verify::verify(&source, &self.paths.encrypted_db, &keys))
        {
            Ok(result) => result,
            Err(err) => {
                self.phase = Phase::Failed;
                return Err(err);
            }
        };

        if result.is_fully_positive() {
            self.verification = Some(result);
        } else {
            if self.paths.encrypted_db.exists() {
                let _ = fs::remove_file(&self.paths.encrypted_db);
            }
            self.verification = None;
            self.phase = Phase::Failed;
        }
        Ok(result)
    }

    /// Apply the terminal choice. Requires a fully positive verification;
    /// `Complete` is terminal, so a second finalize is rejected.
    pub fn finalize_migration(&mut self, choice: FinalizeChoice) -> Result<()> {
        self.expect_phase(Phase::Verifying, "finalize_migration")?;
        let verified = self
            .verification
            .map(|v| v.is_fully_positive())
            .unwrap_or(false);
        if !verified {
            return Err(Error::IllegalTransition {
                phase: "Verifying",
                op: "finalize_migration before a positive verification",
            });
        }

        if choice == FinalizeChoice::DeleteOriginal {
            backup::secure_delete(&self.paths.source_db)?;
            if let Some(snapshot) = self.snapshot.take() {
                self.backup.discard(&snapshot)?;
            }
        }

        // Secret material is scoped to the active migration.
        self.keys = None;
        self.phase = Phase::Complete;
        self.release_guard();
        logger::debug(&format!("migration finalized: {choice:?}"));
        Ok(())
    }

    /// Return to `Backup` with a fresh destination artifact after a failure.
    /// The preserved snapshot is reused when it still verifies, and a lost
    /// or changed source is restored from it.
    pub fn retry(&mut self) -> Result<()> {
        self.expect_phase(Phase::Failed, "retry")?;

        if self.paths.encrypted_db.exists() {
            fs::remove_file(&self.paths.encrypted_db)?;
        }
        self.record = None;
        self.verification = None;

        let snapshot_intact = match &self.snapshot {
            Some(snapshot) => self.backup.verify_snapshot(snapshot)?,
            None => true,
        };
        if !snapshot_intact {
            self.snapshot = None;
        } else if let Some(snapshot) = &self.snapshot
            && !self.backup.source_unchanged(snapshot)?
        {
            // Disaster path: the source was lost or changed after the
            // snapshot was taken; put the verified copy back.
            self.backup.restore(snapshot)?;
        }

        self.phase = Phase::Backup;
        Ok(())
    }

    fn expect_phase(&self, expected: Phase, op: &'static str) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                phase: self.phase.as_str(),
                op,
            })
        }
    }

    fn acquire_guard(&mut self) -> Result<()> {
        if ACTIVE_MIGRATION
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ConcurrencyConflict("a migration"));
        }
        self.holds_guard = true;
        Ok(())
    }

    fn release_guard(&mut self) {
        if self.holds_guard {
            ACTIVE_MIGRATION.store(false, Ordering::SeqCst);
            self.holds_guard = false;
        }
    }
}

impl Drop for MigrationController {
    fn drop(&mut self) {
        self.release_guard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // The controller guard is process-global; serialize tests that hold it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn strong_secret() -> SecretBuf {
        SecretBuf::from_str("Tall-Ships9!Harbor")
    }

    fn seeded_paths(dir: &std::path::Path) -> StorePaths {
        let paths = StorePaths::new(Some(dir)).unwrap();
        let store = SourceStore::create(&paths.source_db).unwrap();
        store.insert_proposal("Logo refresh", "Acme", "scope...").unwrap();
        store.insert_setting("tone", "friendly").unwrap();
        paths
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let mut controller = MigrationController::new(paths);

        assert!(matches!(
            controller.migrate_database("ffff"),
            Err(Error::IllegalTransition { .. })
        ));
        assert!(matches!(
            controller.verify_migration(),
            Err(Error::IllegalTransition { .. })
        ));
        assert!(matches!(
            controller.finalize_migration(FinalizeChoice::KeepBoth),
            Err(Error::IllegalTransition { .. })
        ));
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[test]
    fn test_weak_secret_keeps_controller_idle() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let mut controller = MigrationController::new(paths);

        let err = controller
            .setup_secret(SecretBuf::from_str("short"))
            .unwrap_err();
        assert!(matches!(err, Error::WeakSecret(_)));
        assert_eq!(controller.phase(), Phase::Idle);

        // Guard released, so a fresh setup still works.
        controller.setup_secret(strong_secret()).unwrap();
        assert_eq!(controller.phase(), Phase::RecoveryOptions);
    }

    #[test]
    fn test_second_active_controller_rejected() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp_a = tempdir().unwrap();
        let temp_b = tempdir().unwrap();

        let mut first = MigrationController::new(seeded_paths(temp_a.path()));
        first.setup_secret(strong_secret()).unwrap();

        let mut second = MigrationController::new(seeded_paths(temp_b.path()));
        let err = second.setup_secret(strong_secret()).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict(_)));
    }

    #[test]
    fn test_cancel_only_in_recovery_options() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let mut controller = MigrationController::new(seeded_paths(temp.path()));

        assert!(matches!(
            controller.cancel(),
            Err(Error::IllegalTransition { .. })
        ));

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        assert_eq!(fingerprint.len(), crate::security::FINGERPRINT_LEN);
        controller.cancel().unwrap();
        assert_eq!(controller.phase(), Phase::Idle);

        controller.create_backup().unwrap_err();
    }

    #[test]
    fn test_full_run_keep_both() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let source_db = paths.source_db.clone();
        let encrypted_db = paths.encrypted_db.clone();
        let mut controller = MigrationController::new(paths);

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        controller.create_backup().unwrap();
        let record = controller.migrate_database(&fingerprint).unwrap();
        assert_eq!(record.counts_per_table["proposals"], 1);

        let result = controller.verify_migration().unwrap();
        assert!(result.is_fully_positive());

        controller
            .finalize_migration(FinalizeChoice::KeepBoth)
            .unwrap();
        assert_eq!(controller.phase(), Phase::Complete);
        assert!(source_db.exists());
        assert!(encrypted_db.exists());

        // Complete is terminal.
        let err = controller
            .finalize_migration(FinalizeChoice::KeepBoth)
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[test]
    fn test_delete_original_removes_source_and_snapshot() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let source_db = paths.source_db.clone();
        let mut controller = MigrationController::new(paths);

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        let snapshot = controller.create_backup().unwrap();
        controller.migrate_database(&fingerprint).unwrap();
        controller.verify_migration().unwrap();
        controller
            .finalize_migration(FinalizeChoice::DeleteOriginal)
            .unwrap();

        assert!(!source_db.exists());
        assert!(!snapshot.path.exists());
    }

    #[test]
    fn test_verify_error_moves_to_failed_for_retry() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let encrypted_db = paths.encrypted_db.clone();
        let mut controller = MigrationController::new(paths);

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        controller.create_backup().unwrap();
        controller.migrate_database(&fingerprint).unwrap();

        // Destination vanishes before the gate runs.
        fs::remove_file(&encrypted_db).unwrap();
        controller.verify_migration().unwrap_err();
        assert_eq!(controller.phase(), Phase::Failed);

        controller.retry().unwrap();
        controller.migrate_database(&fingerprint).unwrap();
        let result = controller.verify_migration().unwrap();
        assert!(result.is_fully_positive());
        controller
            .finalize_migration(FinalizeChoice::KeepBoth)
            .unwrap();
    }

    #[test]
    fn test_retry_restores_missing_source_from_snapshot() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let source_db = paths.source_db.clone();
        let mut controller = MigrationController::new(paths);

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        controller.create_backup().unwrap();

        fs::remove_file(&source_db).unwrap();
        controller.migrate_database(&fingerprint).unwrap_err();
        assert_eq!(controller.phase(), Phase::Failed);

        controller.retry().unwrap();
        assert!(source_db.exists());

        let record = controller.migrate_database(&fingerprint).unwrap();
        assert_eq!(record.counts_per_table["proposals"], 1);
    }

    #[test]
    fn test_setup_refuses_rekey_of_migrated_store() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let mut controller = MigrationController::new(paths.clone());

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        controller.create_backup().unwrap();
        controller.migrate_database(&fingerprint).unwrap();
        controller.verify_migration().unwrap();
        controller
            .finalize_migration(FinalizeChoice::KeepBoth)
            .unwrap();
        drop(controller);

        // Both keystore and encrypted store exist; a new secret would orphan
        // the migrated data.
        let mut second = MigrationController::new(paths.clone());
        let err = second.setup_secret(strong_secret()).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)));
        assert_eq!(second.phase(), Phase::Idle);

        // Guard was released, so a fresh directory still works.
        let other = tempdir().unwrap();
        let mut third = MigrationController::new(seeded_paths(other.path()));
        third.setup_secret(strong_secret()).unwrap();
    }

    #[test]
    fn test_source_tampered_after_snapshot_fails_migration() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let source_db = paths.source_db.clone();
        let mut controller = MigrationController::new(paths);

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        controller.create_backup().unwrap();

        let tamper = SourceStore::create(&source_db).unwrap();
        tamper.insert_setting("injected", "late").unwrap();

        let err = controller.migrate_database(&fingerprint).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(controller.phase(), Phase::Failed);
    }

    #[test]
    fn test_retry_preserves_snapshot() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let paths = seeded_paths(temp.path());
        let missing_source = paths.source_db.clone();
        let mut controller = MigrationController::new(paths);

        let fingerprint = controller.setup_secret(strong_secret()).unwrap();
        let snapshot = controller.create_backup().unwrap();

        // Break the migration by removing the source, then restore it.
        std::fs::rename(&missing_source, missing_source.with_extension("moved")).unwrap();
        controller.migrate_database(&fingerprint).unwrap_err();
        assert_eq!(controller.phase(), Phase::Failed);
        std::fs::rename(missing_source.with_extension("moved"), &missing_source).unwrap();

        controller.retry().unwrap();
        assert_eq!(controller.phase(), Phase::Backup);
        assert!(snapshot.path.exists());

        let record = controller.migrate_database(&fingerprint).unwrap();
        assert_eq!(record.counts_per_table["proposals"], 1);
    }
}
