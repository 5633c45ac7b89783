use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cutover", about = "Encrypted store migration and update guard.")]
pub struct Cli {
    /// Base directory holding the stores (defaults to ~/.cutover)
    #[arg(long, global = true, value_name = "DIR")]
    pub base: Option<PathBuf>,

    /// Verbose diagnostic output
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full plaintext-to-encrypted migration
    Migrate(MigrateArgs),
    /// Show on-disk migration and version state
    Status,
    /// Re-derive the store key from a recovery code
    Recover,
    /// Run the post-update health-check suite
    Health,
    /// Check the release manifest for a newer version
    Update(UpdateArgs),
    /// Revert to the previously installed version
    Rollback,
}

#[derive(Args)]
pub struct MigrateArgs {
    /// Securely erase the plaintext store after verification instead of
    /// keeping both copies
    #[arg(long)]
    pub delete_original: bool,

    /// Skip generating a recovery code
    #[arg(long)]
    pub no_recovery: bool,

    /// Print the recovery code directly instead of the guided reveal
    #[arg(long)]
    pub show_recovery: bool,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Release manifest file to consult
    #[arg(long, value_name = "FILE")]
    pub manifest: PathBuf,

    /// Install the offered version instead of just reporting it
    #[arg(long)]
    pub install: bool,
}
