//! Keytap CLI - touch-confirmed U2F/FIDO second factor.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod exit_codes;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0   Success
  1   General error (device protocol failure, bad configuration)
  65  Unsupported factor, unknown status or malformed document
  66  Input file cannot be read
  69  No security key attached, or none could be opened
  75  Key was not touched before the deadline";

#[derive(Parser)]
#[command(name = "keytap")]
#[command(author, version, about = "Touch-confirmed U2F/FIDO second factor", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Enable debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print the result, no status lines
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a factor can be handled by a U2F security key
    Check {
        /// Factor type, e.g. "u2f"
        #[arg(long, value_name = "TYPE")]
        factor_type: String,

        /// Factor provider, e.g. "FIDO"
        #[arg(long, value_name = "PROVIDER")]
        provider: String,
    },

    /// Answer an authentication state document and print the verify payload
    Verify {
        /// Authentication state JSON (reads stdin when omitted or "-")
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,

        /// Use a simulated security key instead of USB hardware (for testing)
        #[arg(long)]
        mock: bool,
    },

    /// List attached FIDO HID security keys
    Devices,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "keytap_core=debug,keytap=debug,info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_file(false)
        .with_line_number(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Check {
            factor_type,
            provider,
        } => commands::check::execute(factor_type, provider, cli.quiet),
        Commands::Verify { file, mock } => commands::verify::execute(file, mock, cli.quiet).await,
        Commands::Devices => commands::devices::execute(cli.quiet),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit = match run(cli).await {
        Ok(()) => ExitCode::success(),
        Err(err) => ExitCode::from_anyhow(&err),
    };

    if let Some(message) = &exit.message {
        eprintln!("{} {}", "Error:".red().bold(), message);
    }
    std::process::exit(exit.code);
}
