//! tactumd: run the stimulation device core against a TCP serial stand-in.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use tactum::config::{self, Config};
use tactum::device::{Device, Peripherals, PollOutcome};
use tactum::hal::sim::{SimBoard, SimPins, SimRegulator, SimTemp};
use tactum::hal::SystemClock;
use tactum::protocol::ComConfig;
use tactum::storage::{FileNv, RECORD_SIZE};
use tactum::transport::TcpPort;
use tactum::types::{DeviceId, ErrorCode, ResetCause};

#[derive(Parser, Debug)]
#[command(name = "tactumd", version, about = "Haptic stimulation device daemon")]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Override the device id
    #[arg(long)]
    device_id: Option<u8>,

    /// Disable payload encryption
    #[arg(long)]
    no_encrypt: bool,

    /// Write an example configuration file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.write_config {
        Config::default().save(path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("loading configuration")?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.device.listen = listen;
    }
    if let Some(id) = cli.device_id {
        config.device.id = id;
    }
    if cli.no_encrypt {
        config.device.encrypt = false;
    }
    config.validate()?;

    config::init_logging(&config.logging)?;
    info!(version = tactum::VERSION, "tactumd starting");

    let com = ComConfig {
        device_id: DeviceId(config.device.id),
        encrypt: config.device.encrypt,
        sync_timeout_ms: config.protocol.sync_timeout.as_millis() as u64,
        tx_timeout_ms: config.protocol.tx_timeout.as_millis() as u64,
        length_error_code: ErrorCode::Eof,
    };

    let board = SimBoard::new();
    board.set_reset_cause(ResetCause::PowerOn);

    loop {
        let peripherals = Peripherals {
            port: Box::new(TcpPort::bind(config.device.listen)?),
            pins: Box::new(SimPins::new()),
            clock: Box::new(SystemClock::new()),
            regulator: Box::new(SimRegulator::new()),
            temp: Box::new(SimTemp::new()),
            board: Box::new(board.clone()),
            memory: Box::new(FileNv::open(&config.device.storage_file, RECORD_SIZE)?),
        };

        let mut device = match Device::new(com.clone(), peripherals) {
            Ok(device) => device,
            Err(e) => {
                error!("boot failed: {e}");
                // fatal errors halt; the watchdog stand-in keeps ticking so
                // an operator can attach
                return Err(e.into());
            }
        };

        loop {
            match device.poll() {
                PollOutcome::Continue => thread::sleep(Duration::from_millis(1)),
                PollOutcome::RestartRequested => {
                    info!("restarting device core");
                    board.set_reset_cause(ResetCause::Software);
                    break;
                }
            }
        }
        drop(device);
    }
}
