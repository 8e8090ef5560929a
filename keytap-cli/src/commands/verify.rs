//! Verify command implementation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use keytap_core::{
    AuthnResponse, DeviceEnumerator, FidoFactor, HidEnumerator, KeytapConfig, MockBehavior,
    MockCounters, MockEnumerator, TouchNotifier,
};
use tracing::{debug, info, warn};

/// Touch prompts for an interactive terminal.
struct TerminalNotifier {
    quiet: bool,
}

impl TouchNotifier for TerminalNotifier {
    fn touch_required(&self) {
        eprintln!(
            "\n{}",
            "Touch the flashing U2F device to authenticate...".yellow().bold()
        );
    }

    fn touch_accepted(&self) {
        if !self.quiet {
            eprintln!(
                "  {} {}",
                "==>".green(),
                "Touch accepted. Proceeding with authentication".green()
            );
        }
    }
}

/// Read the authentication state from `file`, or stdin for `None` and `-`.
fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display())),
        _ => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read authentication state from stdin")?;
            Ok(input)
        }
    }
}

/// Execute the verify command.
pub async fn execute(file: Option<PathBuf>, use_mock: bool, quiet: bool) -> Result<()> {
    let input = read_input(file.as_deref())?;
    info!(bytes = input.len(), "Read authentication state");

    let authn: AuthnResponse =
        serde_json::from_str(&input).context("Failed to parse authentication state")?;
    debug!(status = %authn.status, "Parsed authentication state");

    let config = KeytapConfig::from_env().context("Invalid configuration")?;

    let enumerator: Arc<dyn DeviceEnumerator> = if use_mock {
        warn!("Using MOCK security key (no hardware involved)");
        if !quiet {
            eprintln!("{}", "Using MOCK security key (no hardware involved)".yellow());
        }
        Arc::new(MockEnumerator::single(
            MockBehavior::TouchAfter(1),
            MockCounters::new(),
        ))
    } else {
        Arc::new(HidEnumerator::new())
    };

    let factor =
        FidoFactor::new(enumerator, config).with_notifier(Arc::new(TerminalNotifier { quiet }));
    // Dropping the verify future on Ctrl-C closes the key.
    let (action, payload) = tokio::select! {
        result = factor.verify(&authn) => result?,
        _ = tokio::signal::ctrl_c() => bail!("Interrupted before the security key answered"),
    };

    info!(action, bytes = payload.len(), "Verify payload ready");
    if !quiet {
        eprintln!("{} {}", "Action:".dimmed(), action.bold());
    }
    println!("{}", String::from_utf8_lossy(&payload));
    Ok(())
}
