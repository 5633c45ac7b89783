use std::thread;
use std::time::Duration;

use crate::logger;

/// Bounded exponential backoff for IO operations. One policy object
/// parameterizes every retried call site instead of each site hand-rolling
/// its own loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or attempts are exhausted. On exhaustion
    /// returns the attempt count together with the last error.
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> std::result::Result<T, (u32, E)>
    where
        E: std::fmt::Display,
        F: FnMut() -> std::result::Result<T, E>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    logger::debug(&format!(
                        "{label} attempt {attempt}/{} failed, retrying in {:?}: {err}",
                        self.max_attempts, delay
                    ));
                    thread::sleep(delay);
                    delay *= self.factor;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2,
        }
    }

    #[test]
    fn test_succeeds_first_try() {
        let calls = Cell::new(0);
        let result: Result<i32, (u32, String)> = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let calls = Cell::new(0);
        let result: Result<i32, (u32, String)> = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("transient".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let calls = Cell::new(0);
        let result: Result<i32, (u32, String)> = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            Err("permanent".to_string())
        });
        let (attempts, err) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert_eq!(err, "permanent");
    }
}
