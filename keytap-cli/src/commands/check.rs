//! Check command implementation.

use anyhow::Result;
use colored::Colorize;
use keytap_core::{supports, FactorDescriptor};
use tracing::info;

/// Execute the check command.
pub fn execute(factor_type: String, provider: String, quiet: bool) -> Result<()> {
    let descriptor = FactorDescriptor::new(factor_type, provider);
    supports(&descriptor)?;

    info!(
        factor_type = %descriptor.factor_type,
        provider = %descriptor.provider,
        "Factor supported"
    );
    if !quiet {
        println!(
            "{} {}/{} can be answered with a U2F security key",
            "Supported:".green().bold(),
            descriptor.factor_type,
            descriptor.provider
        );
    }
    Ok(())
}
