use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use qrsend::config::Preferences;
use qrsend::server::{self, ServeOptions};
use qrsend::{content, netselect};

#[derive(Parser)]
#[command(name = "qrsend")]
#[command(about = "Transfer files over the local network via a QR code")]
struct Cli {
    /// Files or directories to transfer
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Zip the content before transferring it
    #[arg(long)]
    zip: bool,

    /// Ignore the saved network interface preference
    #[arg(long)]
    force: bool,

    /// Only print the QR code and the address, and only log errors
    #[arg(long)]
    quiet: bool,

    /// Increase verbosity
    #[arg(long)]
    debug: bool,

    /// Idle timeout in seconds when no client ever connects
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.debug {
        "qrsend=debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(err) = run(cli).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut preferences = if cli.force {
        let preferences = Preferences::default();
        if let Err(err) = preferences.delete() {
            tracing::warn!("unable to delete the preferences file: {err}");
        }
        preferences
    } else {
        Preferences::load()?
    };

    let content = content::resolve(&cli.paths, cli.zip)?;
    let ip = netselect::select_address(&mut preferences)?;

    let options = ServeOptions {
        idle_timeout: Duration::from_secs(cli.timeout),
        quiet: cli.quiet,
    };
    let terminator = server::serve(content, ip, preferences, options).await?;
    tracing::debug!(?terminator, "session ended");
    Ok(())
}
