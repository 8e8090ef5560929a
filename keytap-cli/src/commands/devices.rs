//! Devices command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use keytap_core::HidEnumerator;
use tracing::debug;

/// Execute the devices command.
pub fn execute(quiet: bool) -> Result<()> {
    let devices = HidEnumerator::new()
        .list()
        .context("Failed to enumerate HID devices")?;
    debug!(count = devices.len(), "Listed FIDO HID interfaces");

    if devices.is_empty() {
        if !quiet {
            eprintln!("{}", "No U2F security keys attached".yellow());
        }
        return Ok(());
    }

    for device in &devices {
        if quiet {
            println!("{}", device.path);
        } else {
            println!("{}  {}", device.to_string().bold(), device.path.dimmed());
        }
    }
    Ok(())
}
