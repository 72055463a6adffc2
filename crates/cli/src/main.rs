//! usb-capture
//!
//! Command line harness for the capture core: lists supported devices, or
//! opens one by serial number and prints what it streams.

use anyhow::{Context, Result, anyhow};
use capture::{CaptureConfig, CaptureError, RusbHost, SessionManager};
use clap::Parser;
use common::setup_logging;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-capture")]
#[command(
    author,
    version,
    about = "Stream data from USB interrupt-IN capture devices"
)]
#[command(long_about = "
Opens a capture device by serial number, keeps an interrupt read in flight
in the background, and periodically prints whatever has been buffered.

EXAMPLES:
    # List supported devices
    usb-capture --list-devices

    # Same, as JSON
    usb-capture --list-devices --json

    # Read from the first device five times, one second apart
    usb-capture

    # Read a specific device until Ctrl+C
    usb-capture --serial SN123 --reads 0 --interval-ms 200

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-capture/capture.toml
    3. /etc/usb-capture/capture.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Serial number of the device to open (defaults to the first found)
    #[arg(short, long, value_name = "SERIAL")]
    serial: Option<String>,

    /// Number of reads before closing (0 = until Ctrl+C)
    #[arg(short = 'n', long, default_value_t = 5)]
    reads: u32,

    /// Delay between reads in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Maximum bytes drained per read
    #[arg(long, value_name = "BYTES", default_value_t = 64)]
    max_len: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        capture::config::load_config(path).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-capture v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let host = RusbHost::new().context("Failed to initialize USB host")?;
    let manager = Arc::new(
        SessionManager::new(Arc::new(host), config).context("Failed to create session manager")?,
    );

    let result = if args.list_devices {
        list_devices_mode(&manager, args.json)
    } else {
        capture_mode(Arc::clone(&manager), &args).await
    };

    let shutdown = Arc::clone(&manager);
    if let Err(e) = tokio::task::spawn_blocking(move || shutdown.shutdown()).await {
        error!("Shutdown task failed: {}", e);
    }

    result
}

/// List capture devices and exit
fn list_devices_mode(manager: &SessionManager<RusbHost>, json: bool) -> Result<()> {
    info!("Scanning for capture devices...");
    let devices = manager
        .scan(manager.config().capture.max_scan)
        .context("Failed to scan devices")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("Failed to encode device list")?
        );
        return Ok(());
    }

    if devices.is_empty() {
        println!("No capture devices found.");
    } else {
        println!("Found {} capture device(s):\n", devices.len());
        for (i, device) in devices.iter().enumerate() {
            println!("  [{}] {}", i, device);
        }
    }

    Ok(())
}

/// Open one device and print its buffered data at a fixed interval
async fn capture_mode(manager: Arc<SessionManager<RusbHost>>, args: &Args) -> Result<()> {
    let serial = match &args.serial {
        Some(serial) => serial.clone(),
        None => {
            let devices = manager.scan(1).context("Failed to scan devices")?;
            devices
                .into_iter()
                .next()
                .map(|d| d.serial)
                .ok_or_else(|| anyhow!("No capture devices found"))?
        }
    };

    {
        let manager = Arc::clone(&manager);
        let locator = serial.clone();
        tokio::task::spawn_blocking(move || manager.open(&locator))
            .await
            .context("Open task failed")?
            .with_context(|| format!("Failed to open device {}", serial))?;
    }
    println!("Opened device {}", serial);

    let result = read_loop(&manager, &serial, args).await;

    let closing = Arc::clone(&manager);
    let locator = serial.clone();
    match tokio::task::spawn_blocking(move || closing.close(&locator))
        .await
        .context("Close task failed")?
    {
        Ok(()) => println!("Closed device {}", serial),
        Err(e @ CaptureError::Timeout { .. }) => warn!("{}", e),
        Err(e) => return Err(e).context("Failed to close device"),
    }

    result
}

async fn read_loop(manager: &SessionManager<RusbHost>, serial: &str, args: &Args) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    if args.reads == 0 {
        info!("Press Ctrl+C to stop");
    }

    let mut completed = 0u32;
    while args.reads == 0 || completed < args.reads {
        tokio::select! {
            _ = interval.tick() => {
                let data = manager.read(serial, args.max_len)?;
                completed += 1;
                if data.is_empty() {
                    println!("Read {}: no data", completed);
                } else {
                    println!("Read {}: {} bytes: {}", completed, data.len(), format_hex(&data));
                }
            }
            result = &mut ctrl_c => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, stopping capture"),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
        }
    }

    if let Ok(stats) = manager.stats(serial) {
        info!(
            "Captured {} bytes in {} transfers ({} timeouts, {} bytes dropped)",
            stats.transfers.bytes_received,
            stats.transfers.completions,
            stats.transfers.timeouts,
            stats.ring.dropped
        );
    }

    Ok(())
}

/// Space-separated lowercase hex
fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["usb-capture"]);
        assert_eq!(args.reads, 5);
        assert_eq!(args.interval_ms, 1000);
        assert_eq!(args.max_len, 64);
        assert!(args.serial.is_none());
        assert!(!args.list_devices);
    }

    #[test]
    fn test_json_requires_list_devices() {
        assert!(Args::try_parse_from(["usb-capture", "--json"]).is_err());
        let args = Args::try_parse_from(["usb-capture", "--list-devices", "--json"]).unwrap();
        assert!(args.json);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex(&[0x00, 0xab, 0x7f]), "00 ab 7f");
    }
}
