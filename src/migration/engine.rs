use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::logger;
use crate::migration::{MigrationProgress, ProgressSender};
use crate::security::KeySet;
use crate::store::{EncryptedStore, SourceStore, TABLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Completed,
    Failed,
}

/// Immutable summary of one completed engine run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub counts_per_table: BTreeMap<String, u64>,
    pub started_at: String,
    pub completed_at: String,
    pub duration_ms: u64,
    pub status: MigrationStatus,
}

/// Exclusive hold on the destination artifact for the duration of a run.
/// Backed by a lock file created with `create_new` so a second writer cannot
/// slip in between check and create.
struct DestLock {
    path: PathBuf,
}

impl DestLock {
    fn acquire(dest: &Path) -> Result<Self> {
        let path = dest.with_extension("lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::ConcurrencyConflict("destination store migration"))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for DestLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Copy every logical table from the plaintext source into a fresh encrypted
/// destination. All-or-nothing: any table failure discards the destination
/// artifact entirely; a retry restarts from the backup snapshot.
pub fn migrate(
    source: &SourceStore,
    dest_path: &Path,
    keys: &KeySet,
    progress: Option<&ProgressSender>,
) -> Result<MigrationRecord> {
    let _lock = DestLock::acquire(dest_path)?;

    // Leftover artifact from a failed run; retries always start clean.
    if dest_path.exists() {
        fs::remove_file(dest_path)?;
    }

    let started = Instant::now();
    let started_at = Utc::now().to_rfc3339();

    let pragma = keys.key_pragma_value();
    let mut dest = EncryptedStore::create(dest_path, &pragma)
        .map_err(|err| discard_dest(dest_path, "schema", err))?;

    let mut counts_per_table = BTreeMap::new();
    for &table in TABLES {
        match migrate_table(source, &mut dest, table, progress) {
            Ok(count) => {
                counts_per_table.insert(table.to_string(), count);
            }
            Err(err) => {
                drop(dest);
                return Err(discard_dest(dest_path, table, err));
            }
        }
    }
    drop(dest);

    let record = MigrationRecord {
        counts_per_table,
        started_at,
        completed_at: Utc::now().to_rfc3339(),
        duration_ms: started.elapsed().as_millis() as u64,
        status: MigrationStatus::Completed,
    };
    logger::debug(&format!(
        "migration completed in {} ms: {:?}",
        record.duration_ms, record.counts_per_table
    ));
    Ok(record)
}

fn migrate_table(
    source: &SourceStore,
    dest: &mut EncryptedStore,
    table: &str,
    progress: Option<&ProgressSender>,
) -> Result<u64> {
    let rows = source.read_rows(table)?;
    let total = rows.len() as u64;

    // A table with zero rows is valid; it is recorded as zero, not an error.
    if total == 0 {
        emit(progress, table, 0, 0);
        return Ok(0);
    }

    dest.insert_rows(table, &rows)?;
    for current in 1..=total {
        emit(progress, table, current, total);
    }
    Ok(total)
}

fn emit(progress: Option<&ProgressSender>, table: &str, current: u64, total: u64) {
    if let Some(sender) = progress {
        // Fire-and-forget: a dropped subscriber never fails the migration.
        let _ = sender.send(MigrationProgress {
            table: table.to_string(),
            current,
            total,
        });
    }
}

fn discard_dest(dest_path: &Path, table: &str, err: Error) -> Error {
    if dest_path.exists() {
        let _ = fs::remove_file(dest_path);
    }
    logger::error(&format!(
        "migration failed on '{table}', destination discarded: {err}"
    ));
    Error::MigrationFailed {
        table: table.to_string(),
        cause: err.to_string(),
    }
}
