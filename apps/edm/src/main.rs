//! # edm
//!
//! The command-line binary of the Entity Data Model engine.
//!
//! ## Usage
//!
//! ```bash
//! # Define the schema of a space, then create and read objects
//! edm -s lab schema define schema.json
//! edm -s lab create BeamState beam_state.json
//! edm -s lab get BeamState 000000000000000000000001 -p 'csState[:].bendingMoment'
//!
//! # Objects that a clone may share when only these paths change
//! edm -s lab safe-links BeamState 000000000000000000000001 'csState[0].rveStates[:]'
//! ```

use clap::Parser;
use edm::cli;
use edm::config::{self, LogFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    let settings = match cli.settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    // EDM_LOG_FORMAT=json enables machine-parseable output.
    let log_format = config::log_format_from_env().unwrap_or(settings.log_format);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edm=info,edm_core=info".into());

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if let Err(e) = cli::execute(&cli, &settings) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
