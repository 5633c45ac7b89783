//! Plaintext-to-encrypted store migration.
//!
//! - `engine` copies every table into a fresh SQLCipher destination,
//!   all-or-nothing per run
//! - `verify` gates destructive cleanup on counts, sampled row equality,
//!   and a no-key read probe
//! - `controller` owns the phase state machine and the finalize choice

pub mod controller;
pub mod engine;
pub mod verify;

pub use controller::{FinalizeChoice, MigrationController, Phase};
pub use engine::{MigrationRecord, MigrationStatus};
pub use verify::VerificationResult;

use std::sync::mpsc;

use serde::Serialize;

/// One-way progress event, sequenced per table. Consumers subscribe; the
/// engine never blocks on them.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationProgress {
    pub table: String,
    pub current: u64,
    pub total: u64,
}

pub type ProgressSender = mpsc::Sender<MigrationProgress>;
pub type ProgressReceiver = mpsc::Receiver<MigrationProgress>;
