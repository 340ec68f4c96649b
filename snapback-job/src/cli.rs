use clap::{Parser, Subcommand};

/// Snapback - scale a workload down, back up its volume to S3, scale it back up
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run one backup (the default when no command is given)
    Run,

    /// Show the configuration read from the environment
    Config {
        /// Print secret values instead of hiding them
        #[arg(long)]
        show_secrets: bool,
    },
}
