//! tarn — operator tool for the tarn connection pool.
//!
//! # Usage
//!
//! ```text
//! tarn check pools.toml
//! tarn simulate --config pools.toml --clients 16 --duration-ms 5000
//! ```

use clap::{Parser, Subcommand};

mod commands;
mod sim;

#[derive(Parser)]
#[command(
    name = "tarn",
    about = "Tarn — client-side connection pool",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pool configuration file
    Check {
        /// Path to the pools TOML file
        config: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Run the configured pools against a simulated driver under load.
    ///
    /// Without --config a single pool named "demo" is used.
    Simulate(commands::simulate::SimulateArgs),
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tarn=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Check { config, format } => commands::check::check(&config, &format),
        Commands::Simulate(args) => commands::simulate::simulate(args).await,
    }
}
