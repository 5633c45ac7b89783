use std::path::Path;

use rand::Rng;
use serde::Serialize;

use crate::error::Result;
use crate::logger;
use crate::security::KeySet;
use crate::store::{EncryptedStore, SourceStore, TABLES};

/// Upper bound on randomly sampled rows compared per table.
pub const SAMPLE_ROWS_PER_TABLE: u64 = 5;

/// Outcome of the three verification checks. Only a fully positive result
/// unlocks the destructive finalize choice.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerificationResult {
    pub counts_match: bool,
    pub sample_checks_passed: bool,
    pub encryption_confirmed: bool,
}

impl VerificationResult {
    pub fn is_fully_positive(&self) -> bool {
        self.counts_match && self.sample_checks_passed && self.encryption_confirmed
    }
}

/// Confirm the migrated store is complete and actually encrypted:
/// (a) exact per-table row count equality,
/// (b) field-level equality on a bounded random sample of rows per table,
/// (c) the destination must be unreadable without the key.
pub fn verify(source: &SourceStore, dest_path: &Path, keys: &KeySet) -> Result<VerificationResult> {
    let pragma = keys.key_pragma_value();
    let dest = EncryptedStore::open(dest_path, &pragma)?;

    let counts_match = check_counts(source, &dest)?;
    let sample_checks_passed = check_samples(source, &dest)?;
    drop(dest);

    let encryption_confirmed = EncryptedStore::unreadable_without_key(dest_path)?;

    let result = VerificationResult {
        counts_match,
        sample_checks_passed,
        encryption_confirmed,
    };
    if !result.is_fully_positive() {
        logger::error(&format!("verification failed: {result:?}"));
    }
    Ok(result)
}

fn check_counts(source: &SourceStore, dest: &EncryptedStore) -> Result<bool> {
    for &table in TABLES {
        if source.count_rows(table)? != dest.count_rows(table)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn check_samples(source: &SourceStore, dest: &EncryptedStore) -> Result<bool> {
    let mut rng = rand::thread_rng();
    for &table in TABLES {
        let count = source.count_rows(table)?;
        if count == 0 {
            continue;
        }
        let samples = count.min(SAMPLE_ROWS_PER_TABLE);
        for _ in 0..samples {
            let offset = rng.gen_range(0..count);
            let source_row = source.row_at(table, offset)?;
            let dest_row = dest.row_at(table, offset)?;
            match (source_row, dest_row) {
                (Some(a), Some(b)) if a == b => {}
                _ => return Ok(false),
            }
        }
    }
    Ok(true)
}
