use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::logger;
use crate::paths::StorePaths;
use crate::store::{EncryptedStore, TABLES};

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SUITE_TIMEOUT: Duration = Duration::from_secs(30);

/// At most one suite run at a time, process-wide.
static ACTIVE_SUITE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Serialize)]
pub struct CheckFailure {
    pub check: String,
    pub error: String,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub passed: bool,
    pub checks_run: u32,
    pub failures: Vec<CheckFailure>,
    pub duration_ms: u64,
}

/// Everything a check may touch. Cloned into the worker thread per check.
#[derive(Clone)]
pub struct CheckContext {
    pub paths: StorePaths,
    pub key_pragma: Option<Zeroizing<String>>,
}

pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn critical(&self) -> bool;
    fn run(&self, ctx: &CheckContext) -> Result<()>;
}

/// Post-update correctness probes, run in a fixed order. Each check gets its
/// own timeout; a timed-out check counts as failed but never aborts the rest
/// of the suite, so the full failure list is always available.
pub struct HealthCheckSuite {
    ctx: CheckContext,
    checks: Vec<Arc<dyn HealthCheck>>,
    check_timeout: Duration,
    suite_timeout: Duration,
}

impl HealthCheckSuite {
    pub fn new(ctx: CheckContext) -> Self {
        Self {
            ctx,
            checks: vec![
                Arc::new(StoreSelfTest),
                Arc::new(SettingsReadable),
                Arc::new(CriticalPathSmoke),
                Arc::new(VersionMarkerConsistent),
            ],
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            suite_timeout: DEFAULT_SUITE_TIMEOUT,
        }
    }

    pub fn with_checks(ctx: CheckContext, checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self {
            ctx,
            checks,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            suite_timeout: DEFAULT_SUITE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, check_timeout: Duration, suite_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self.suite_timeout = suite_timeout;
        self
    }

    pub fn run(&self) -> Result<HealthCheckResult> {
        if ACTIVE_SUITE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ConcurrencyConflict("the health-check suite"));
        }
        let _guard = SuiteGuard;

        let started = Instant::now();
        let mut failures = Vec::new();
        let mut checks_run = 0u32;

        for check in &self.checks {
            checks_run += 1;
            let name = check.name();
            let critical = check.critical();

            let remaining = self.suite_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                // Aggregate deadline exhausted: remaining checks are recorded
                // as failed without being started.
                failures.push(CheckFailure {
                    check: name.to_string(),
                    error: "suite deadline exceeded before check started".to_string(),
                    critical,
                });
                continue;
            }

            let timeout = self.check_timeout.min(remaining);
            let (tx, rx) = mpsc::channel();
            let worker = Arc::clone(check);
            let ctx = self.ctx.clone();
            thread::spawn(move || {
                let _ = tx.send(worker.run(&ctx).map_err(|err| err.to_string()));
            });

            match rx.recv_timeout(timeout) {
                Ok(Ok(())) => logger::debug(&format!("health check '{name}' passed")),
                Ok(Err(error)) => failures.push(CheckFailure {
                    check: name.to_string(),
                    error,
                    critical,
                }),
                // The worker thread is abandoned; its eventual result is
                // discarded.
                Err(_) => failures.push(CheckFailure {
                    check: name.to_string(),
                    error: Error::Timeout {
                        check: name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .to_string(),
                    critical,
                }),
            }
        }

        Ok(HealthCheckResult {
            passed: failures.is_empty(),
            checks_run,
            failures,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

struct SuiteGuard;

impl Drop for SuiteGuard {
    fn drop(&mut self) {
        ACTIVE_SUITE.store(false, Ordering::SeqCst);
    }
}

/// Open the encrypted store with the active key and count every table.
pub struct StoreSelfTest;

impl HealthCheck for StoreSelfTest {
    fn name(&self) -> &'static str {
        "Database integrity"
    }

    fn critical(&self) -> bool {
        true
    }

    fn run(&self, ctx: &CheckContext) -> Result<()> {
        let pragma = ctx.key_pragma.as_ref().ok_or_else(|| {
            Error::CryptoFailure("no key available for store self-test".to_string())
        })?;
        let store = EncryptedStore::open(&ctx.paths.encrypted_db, pragma)?;
        for &table in TABLES {
            store.count_rows(table)?;
        }
        Ok(())
    }
}

/// The plain settings file must parse.
pub struct SettingsReadable;

impl HealthCheck for SettingsReadable {
    fn name(&self) -> &'static str {
        "Settings store"
    }

    fn critical(&self) -> bool {
        false
    }

    fn run(&self, ctx: &CheckContext) -> Result<()> {
        Settings::load(&ctx.paths)?;
        Ok(())
    }
}

/// Write, read back, and delete a probe row through the full store path.
pub struct CriticalPathSmoke;

impl HealthCheck for CriticalPathSmoke {
    fn name(&self) -> &'static str {
        "Critical path"
    }

    fn critical(&self) -> bool {
        true
    }

    fn run(&self, ctx: &CheckContext) -> Result<()> {
        let pragma = ctx.key_pragma.as_ref().ok_or_else(|| {
            Error::CryptoFailure("no key available for smoke test".to_string())
        })?;
        let store = EncryptedStore::open(&ctx.paths.encrypted_db, pragma)?;
        store.smoke_test()
    }
}

/// A pending update must agree with the installed-version marker.
pub struct VersionMarkerConsistent;

impl HealthCheck for VersionMarkerConsistent {
    fn name(&self) -> &'static str {
        "Version markers"
    }

    fn critical(&self) -> bool {
        false
    }

    fn run(&self, ctx: &CheckContext) -> Result<()> {
        let settings = Settings::load(&ctx.paths)?;
        if let Some(pending) = &settings.pending_update
            && pending.to_version != settings.installed_version
        {
            return Err(Error::Health(format!(
                "pending update targets {} but {} is installed",
                pending.to_version, settings.installed_version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // The suite guard is process-global; serialize tests that exercise it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    struct AlwaysPasses;
    impl HealthCheck for AlwaysPasses {
        fn name(&self) -> &'static str {
            "Always passes"
        }
        fn critical(&self) -> bool {
            false
        }
        fn run(&self, _ctx: &CheckContext) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;
    impl HealthCheck for AlwaysFails {
        fn name(&self) -> &'static str {
            "Always fails"
        }
        fn critical(&self) -> bool {
            true
        }
        fn run(&self, _ctx: &CheckContext) -> Result<()> {
            Err(Error::CryptoFailure("broken".to_string()))
        }
    }

    struct Sleeps;
    impl HealthCheck for Sleeps {
        fn name(&self) -> &'static str {
            "Sleeps"
        }
        fn critical(&self) -> bool {
            false
        }
        fn run(&self, _ctx: &CheckContext) -> Result<()> {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }

    fn test_ctx(dir: &std::path::Path) -> CheckContext {
        CheckContext {
            paths: StorePaths::new(Some(dir)).unwrap(),
            key_pragma: None,
        }
    }

    #[test]
    fn test_all_passing_suite() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let suite = HealthCheckSuite::with_checks(
            test_ctx(temp.path()),
            vec![Arc::new(AlwaysPasses), Arc::new(AlwaysPasses)],
        );
        let result = suite.run().unwrap();
        assert!(result.passed);
        assert_eq!(result.checks_run, 2);
        assert!(result.failures.is_empty());
    }

    #[test]
    fn test_failure_does_not_abort_suite() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let suite = HealthCheckSuite::with_checks(
            test_ctx(temp.path()),
            vec![
                Arc::new(AlwaysFails),
                Arc::new(AlwaysPasses),
                Arc::new(AlwaysFails),
            ],
        );
        let result = suite.run().unwrap();
        assert!(!result.passed);
        assert_eq!(result.checks_run, 3);
        assert_eq!(result.failures.len(), 2);
        assert!(result.failures.iter().all(|f| f.critical));
    }

    #[test]
    fn test_timed_out_check_counts_as_failed() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let suite = HealthCheckSuite::with_checks(
            test_ctx(temp.path()),
            vec![Arc::new(Sleeps), Arc::new(AlwaysPasses)],
        )
        .with_timeouts(Duration::from_millis(20), Duration::from_secs(5));
        let result = suite.run().unwrap();
        assert!(!result.passed);
        assert_eq!(result.checks_run, 2);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].error.contains("exceeded its"));
        assert!(result.failures[0].error.contains("Sleeps"));
    }

    #[test]
    fn test_suite_deadline_marks_remaining_failed() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let suite = HealthCheckSuite::with_checks(
            test_ctx(temp.path()),
            vec![Arc::new(Sleeps), Arc::new(AlwaysPasses)],
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_millis(20));
        let result = suite.run().unwrap();
        assert!(!result.passed);
        // First check ate the whole budget; second recorded without running.
        assert_eq!(result.failures.len(), 2);
        assert!(result.failures[1].error.contains("deadline"));
    }

    #[test]
    fn test_guard_released_between_runs() {
        let _guard = TEST_LOCK.lock().unwrap();
        let temp = tempdir().unwrap();
        let suite =
            HealthCheckSuite::with_checks(test_ctx(temp.path()), vec![Arc::new(AlwaysPasses)]);
        suite.run().unwrap();
        suite.run().unwrap();
    }
}
