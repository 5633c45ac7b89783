mod cli;
mod prompt;

use std::io::{self, IsTerminal, Write};

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use cutover::health::{CheckContext, HealthCheckSuite};
use cutover::keystore::Keystore;
use cutover::logger;
use cutover::migration::{FinalizeChoice, MigrationController};
use cutover::paths::StorePaths;
use cutover::update::{ManifestProvider, UpdateGuard, UpdateOutcome};

use crate::cli::{Cli, Commands, MigrateArgs, UpdateArgs};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logger::set_debug(cli.debug);

    let paths = StorePaths::new(cli.base.as_deref())?;
    paths.ensure_base_dir()?;
    announce_rollback(&paths)?;

    match cli.command {
        Commands::Migrate(args) => cmd_migrate(&paths, args),
        Commands::Status => cmd_status(&paths),
        Commands::Recover => cmd_recover(&paths),
        Commands::Health => cmd_health(&paths),
        Commands::Update(args) => cmd_update(&paths, args),
        Commands::Rollback => cmd_rollback(&paths),
    }
}

/// Surfaced exactly once after a rollback; reading the record clears it.
fn announce_rollback(paths: &StorePaths) -> Result<()> {
    let guard = UpdateGuard::load(paths.clone())?;
    if let Some(record) = guard.check_and_clear_rollback()? {
        println!(
            "⚠️  Version {} failed its health checks and was rolled back to {}.",
            record.failed_version, record.previous_version
        );
        println!("   Reason: {}", record.reason);
    }
    Ok(())
}

fn cmd_migrate(paths: &StorePaths, args: MigrateArgs) -> Result<()> {
    if !paths.source_db.exists() {
        return Err(anyhow!(
            "No plaintext store found at {}",
            paths.source_db.display()
        ));
    }

    let mut controller = MigrationController::new(paths.clone());

    let secret = prompt::prompt_new_secret()?;
    let fingerprint = controller
        .setup_secret(secret)
        .context("Failed to set up the encryption secret")?;
    println!("🔑 Key established (fingerprint {fingerprint}).");

    if !args.no_recovery {
        let code = controller.generate_recovery_secret()?;
        display_recovery(code.reveal(), args.show_recovery)?;
    }

    let snapshot = controller.create_backup().context("Backup failed")?;
    println!(
        "📦 Backup written to {} ({} bytes).",
        snapshot.path.display(),
        snapshot.size_bytes
    );

    let progress = controller.subscribe();
    let record = controller
        .migrate_database(&fingerprint)
        .context("Migration failed; the plaintext store and backup are untouched")?;
    for event in progress.try_iter() {
        logger::debug(&format!(
            "migrated {} {}/{}",
            event.table, event.current, event.total
        ));
    }
    for (table, count) in &record.counts_per_table {
        println!("✅ {table}: {count} rows migrated.");
    }

    let result = controller.verify_migration()?;
    if !result.is_fully_positive() {
        return Err(anyhow!(
            "Verification failed; the encrypted copy was discarded. Run migrate again to retry."
        ));
    }
    println!("✅ Verification passed (counts, samples, encryption).");

    let choice = if args.delete_original {
        FinalizeChoice::DeleteOriginal
    } else {
        FinalizeChoice::KeepBoth
    };
    controller.finalize_migration(choice)?;
    match choice {
        FinalizeChoice::DeleteOriginal => {
            println!("🗑️  Plaintext store securely erased. Encrypted store is now authoritative.")
        }
        FinalizeChoice::KeepBoth => println!(
            "✅ Migration complete. Plaintext store kept at {}.",
            paths.source_db.display()
        ),
    }
    Ok(())
}

fn display_recovery(code: &str, show_plain: bool) -> Result<()> {
    if show_plain {
        println!("🧩 Recovery code (store this safely):\n{code}");
        return Ok(());
    }

    println!("🧩 Recovery code (shown once, never stored):\n{code}");
    if io::stdin().is_terminal() {
        print!("Press Enter once you have saved it securely...");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        #[cfg(unix)]
        {
            print!("\x1b[2J\x1b[H");
            io::stdout().flush()?;
        }
    }
    Ok(())
}

fn cmd_status(paths: &StorePaths) -> Result<()> {
    let guard = UpdateGuard::load(paths.clone())?;

    println!("Installed version: {}", guard.settings.installed_version);
    if let Some(previous) = &guard.settings.previous_version {
        println!("Previous version:  {previous}");
    }
    if let Some(pending) = &guard.settings.pending_update {
        println!(
            "Pending update:    {} -> {} (awaiting health checks)",
            pending.from_version, pending.to_version
        );
    }
    if !guard.settings.skipped_versions.is_empty() {
        println!("Skipped versions:  {}", guard.settings.skipped_versions.join(", "));
    }

    println!(
        "Plaintext store:   {}",
        presence(&paths.source_db)
    );
    println!(
        "Encrypted store:   {}",
        presence(&paths.encrypted_db)
    );
    println!(
        "Keystore:          {}",
        presence(&paths.keystore_path)
    );
    Ok(())
}

fn presence(path: &std::path::Path) -> String {
    if path.exists() {
        format!("{} (present)", path.display())
    } else {
        format!("{} (absent)", path.display())
    }
}

fn cmd_recover(paths: &StorePaths) -> Result<()> {
    let keystore = Keystore::load(&paths.keystore_path)
        .context("No keystore found; nothing to recover")?;

    let code = prompt::prompt_recovery_code()?;
    let code_str = std::str::from_utf8(code.expose_secret())
        .map_err(|_| anyhow!("Recovery code must be valid UTF-8"))?;
    let keys = keystore
        .unwrap_with_recovery(code_str)
        .context("Recovery failed")?;

    println!(
        "✅ Store key recovered (fingerprint {}). The encrypted store can be unlocked.",
        keys.fingerprint
    );
    Ok(())
}

fn cmd_health(paths: &StorePaths) -> Result<()> {
    let key_pragma = if paths.encrypted_db.exists() {
        let keystore = Keystore::load(&paths.keystore_path)
            .context("Encrypted store present but keystore is missing")?;
        let secret = prompt::prompt_secret_once()?;
        let keys = keystore.unlock_with_secret(&secret)?;
        Some(keys.key_pragma_value())
    } else {
        None
    };

    let suite = HealthCheckSuite::new(CheckContext {
        paths: paths.clone(),
        key_pragma,
    });
    let mut guard = UpdateGuard::load(paths.clone())?;
    let (result, outcome) = guard.run_health_checks(&suite)?;

    println!(
        "Ran {} checks in {} ms.",
        result.checks_run, result.duration_ms
    );
    for failure in &result.failures {
        let marker = if failure.critical { "❌" } else { "⚠️ " };
        println!("{marker} {}: {}", failure.check, failure.error);
    }

    match outcome {
        UpdateOutcome::Healthy => {
            println!("✅ All health checks passed.");
            Ok(())
        }
        UpdateOutcome::RolledBack(record, _restart) => Err(anyhow!(
            "Health checks failed; rolled back {} -> {}. Restart the application.",
            record.failed_version,
            record.previous_version
        )),
        UpdateOutcome::Unhealthy => Err(anyhow!(
            "Health checks failed ({} failures); no pending update to revert.",
            result.failures.len()
        )),
    }
}

fn cmd_update(paths: &StorePaths, args: UpdateArgs) -> Result<()> {
    let mut guard = UpdateGuard::load(paths.clone())?;
    let provider = ManifestProvider::new(args.manifest);

    let Some(info) = guard.check_for_update(&provider)? else {
        println!(
            "✅ Up to date (version {}).",
            guard.settings.installed_version
        );
        return Ok(());
    };

    let tag = if info.critical { " (critical)" } else { "" };
    println!("⬆️  Version {} is available{tag}.", info.version);
    if let Some(notes) = &info.notes {
        println!("   {notes}");
    }

    if args.install {
        let _restart = guard.install_update(&info)?;
        println!(
            "✅ Version {} staged. Restart the application; health checks will confirm or revert it.",
            info.version
        );
    }
    Ok(())
}

fn cmd_rollback(paths: &StorePaths) -> Result<()> {
    let mut guard = UpdateGuard::load(paths.clone())?;
    let (record, _restart) = guard
        .rollback_to_previous_version("manual rollback requested")
        .context("Rollback failed")?;
    println!(
        "✅ Rolled back {} -> {}. Restart the application.",
        record.failed_version, record.previous_version
    );
    Ok(())
}
