use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use nubo::actuator::{ActuatorState, ActuatorStatus};

use nubo_device::connector::ConnectorBuilder;
use nubo_device::error::Error;
use nubo_device::files::{DEFAULT_MAX_PACKET_SIZE, FileManagement};
use nubo_device::repository::JsonFileRepository;
use nubo_device::url::HttpFileDownloader;

use tracing::{error, info};

// The reference of the only actuator of the device.
const SWITCH: &str = "SW";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Device key.
    #[arg(short = 'k', long)]
    key: String,

    /// Device password.
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Broker host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Broker port.
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Directory of the received files.
    #[arg(short = 'd', long, default_value = "files")]
    directory: PathBuf,

    /// Maximum number of bytes per packet, 0 disables chunked transfers.
    #[arg(long, default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: u64,

    /// Timeout in seconds of each URL download.
    #[arg(long, default_value_t = 300)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();

    let switch = Arc::new(AtomicBool::new(false));
    let handler = {
        let switch = Arc::clone(&switch);
        move |reference: &str, value: &str| {
            if reference == SWITCH {
                switch.store(value == "true", Ordering::Relaxed);
            }
        }
    };
    let provider = {
        let switch = Arc::clone(&switch);
        move |reference: &str| {
            if reference == SWITCH {
                ActuatorStatus::new(ActuatorState::Ready, switch.load(Ordering::Relaxed).to_string())
            } else {
                ActuatorStatus::new(ActuatorState::Error, "")
            }
        }
    };

    let downloader =
        HttpFileDownloader::new().timeout(Duration::from_secs(cli.download_timeout));
    let repository = JsonFileRepository::open(cli.directory.with_extension("json"))?;

    let mut builder = ConnectorBuilder::new(cli.key)
        .host(cli.host)
        .port(cli.port)
        .file_management(
            FileManagement::new(cli.directory)
                .max_packet_size(cli.max_packet_size)
                .url_downloader(Arc::new(downloader)),
        )
        .file_repository(Arc::new(repository))
        .actuation(Arc::new(handler), Arc::new(provider));

    if let Some(password) = cli.password {
        builder = builder.password(password);
    }

    let connector = builder.build()?;
    connector.connect()?;
    info!("Device started, press Ctrl-C to stop it");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Impossible to listen for Ctrl-C: {e}");
    }

    connector.disconnect().await;

    Ok(())
}
