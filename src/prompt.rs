use std::io::{self, IsTerminal, Write};
use std::process::{Command, Stdio};

use anyhow::{Result, anyhow};

use cutover::logger;
use cutover::security::SecretBuf;
use cutover::security::memory::constant_time_compare;

pub fn prompt_new_secret() -> Result<SecretBuf> {
    let first = prompt_secret("🔒 New encryption secret: ")?;
    let second = prompt_secret("🔒 Confirm encryption secret: ")?;

    if !constant_time_compare(first.expose_secret(), second.expose_secret()) {
        return Err(anyhow!("Secrets do not match"));
    }
    Ok(first)
}

pub fn prompt_secret_once() -> Result<SecretBuf> {
    prompt_secret("🔒 Encryption secret: ")
}

pub fn prompt_recovery_code() -> Result<SecretBuf> {
    prompt_secret("🧩 Recovery code: ")
}

fn prompt_secret(prompt: &str) -> Result<SecretBuf> {
    print!("{prompt}");
    io::stdout().flush()?;

    let stdin = io::stdin();
    let is_tty = stdin.is_terminal();

    if is_tty {
        set_terminal_echo(false);
    }

    let mut secret = String::new();
    stdin.read_line(&mut secret)?;

    if is_tty {
        set_terminal_echo(true);
        println!();
    }

    Ok(SecretBuf::from_str(secret.trim()))
}

fn set_terminal_echo(enabled: bool) {
    #[cfg(unix)]
    {
        let arg = if enabled { "echo" } else { "-echo" };
        if let Err(err) = Command::new("stty")
            .arg(arg)
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            logger::debug(&format!("Failed to set terminal echo: {err}"));
        }
    }
}
