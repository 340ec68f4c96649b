use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use snapback_workflow::LogCapture;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod commands;
mod config;

use cli::{Args, Mode};

/// Initialize tracing with two outputs:
/// 1. Console output (stdout) for the pod log
/// 2. An in-memory copy without colors, sent along with the notification
fn initialize_tracing(capture: &LogCapture) -> Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,\
         kube=warn,\
         hyper=warn,\
         aws_config=warn,\
         aws_smithy_runtime=warn,\
         aws_sdk_s3=warn"
            .into()
    });

    let console_layer = fmt::layer().with_writer(std::io::stdout);
    let capture_layer = fmt::layer().with_ansi(false).with_writer(capture.clone());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(capture_layer)
        .try_init()?;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let result = match args.mode.unwrap_or(Mode::Run) {
        Mode::Run => {
            let capture = LogCapture::new();
            match initialize_tracing(&capture) {
                Ok(()) => commands::run::run(capture).await,
                Err(err) => Err(err),
            }
        }
        Mode::Config { show_secrets } => commands::config::show(show_secrets),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
