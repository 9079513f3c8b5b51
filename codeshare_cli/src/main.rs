use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use codeshare_core::config::{AppConfig, BackendKind};
use codeshare_core::probe::DeviceClass;
use codeshare_core::rendezvous::server::RENDEZVOUS_PORT;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod events;

use commands::Action;

#[derive(Parser)]
#[command(name = "codeshare")]
#[command(about = "Peer-to-peer file transfer with short rendezvous codes", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Where offers are published
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// WebSocket URL of a `codeshare serve` instance
    #[arg(long, global = true)]
    remote_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Offer a file under a fresh code
    Send {
        path: PathBuf,

        /// End-to-end encrypt every chunk
        #[arg(long)]
        encrypt: bool,

        #[arg(long, value_enum)]
        device: Option<DeviceArg>,
    },
    /// Fetch the file offered under CODE
    Receive {
        code: String,

        /// Output directory (defaults to the configured download path)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Run a rendezvous server for the remote backend
    Serve {
        #[arg(short, long, default_value_t = RENDEZVOUS_PORT)]
        port: u16,
    },
    /// Measure the network and print the derived transfer profile
    Probe,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    File,
    Remote,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => BackendKind::Memory,
            BackendArg::File => BackendKind::File,
            BackendArg::Remote => BackendKind::Remote,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Desktop,
    Mobile,
    LowMemory,
}

impl From<DeviceArg> for DeviceClass {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Desktop => DeviceClass::Desktop,
            DeviceArg::Mobile => DeviceClass::Mobile,
            DeviceArg::LowMemory => DeviceClass::LowMemory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env may carry RUST_LOG or a rendezvous URL
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = AppConfig::load();
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }
    if let Some(url) = cli.remote_url {
        config.remote_url = Some(url);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let action = match cli.command {
        Commands::Serve { port } => return commands::run_server(port, cancel).await,
        Commands::Probe => return commands::run_probe(&config, &cancel).await,
        Commands::Send {
            path,
            encrypt,
            device,
        } => {
            if let Some(device) = device {
                config.device_class = device.into();
            }
            Action::Send { path, encrypt }
        }
        Commands::Receive { code, out } => Action::Receive {
            code,
            out: out.unwrap_or_else(|| config.download_path.clone()),
        },
    };

    let (event_tx, event_rx) = mpsc::channel(1000);
    let printer = tokio::spawn(events::print_events(event_rx));

    let result = commands::run_transfer(&config, action, cancel, event_tx).await;
    let _ = printer.await;
    result
}
