// twl — Three-Wire UART (H5) link tool
//
// Brings the link up over a serial port, optionally sends one reliable
// payload, and prints whatever the controller delivers.

mod serial;

use anyhow::{Context, Result};
use clap::Parser;
use serial::SerialTransport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threewire_core::{H5Link, H5LinkConfig, LinkDelegate, LinkEvent, TransportError};

#[derive(Parser)]
#[command(name = "twl")]
#[command(about = "Three-Wire UART (H5) link tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Serial port path, e.g. /dev/ttyACM0
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Acknowledgement timeout per transmission, in milliseconds
    #[arg(long, default_value_t = 250)]
    retransmission_timeout_ms: u64,

    /// Hex-encoded payload to send once the link is ACTIVE
    #[arg(short, long)]
    send: Option<String>,

    /// Keep listening for this many seconds after establishment
    #[arg(short, long, default_value_t = 0)]
    listen_secs: u64,
}

struct PrintDelegate {
    received: AtomicU64,
}

impl LinkDelegate for PrintDelegate {
    fn on_data(&self, payload: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
        println!("<- {}", hex::encode(payload));
    }

    fn on_event(&self, event: LinkEvent) {
        tracing::info!("link event: {:?}", event);
    }

    fn on_error(&self, error: TransportError) {
        tracing::error!("transport error: {}", error);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let payload = cli
        .send
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("payload must be hex")?;

    let transport = SerialTransport::new(&cli.port, cli.baud);
    let link = H5Link::new(
        Box::new(transport),
        H5LinkConfig {
            retransmission_timeout: Duration::from_millis(cli.retransmission_timeout_ms),
        },
    );
    let delegate = Arc::new(PrintDelegate {
        received: AtomicU64::new(0),
    });

    tracing::info!("establishing link on {}", cli.port);
    link.open(delegate.clone())
        .context("link establishment failed")?;
    tracing::info!("link is {}", link.state());

    if let Some(payload) = payload {
        link.send(&payload).context("reliable send failed")?;
        tracing::info!("payload acknowledged");
    }

    if cli.listen_secs > 0 {
        std::thread::sleep(Duration::from_secs(cli.listen_secs));
    }

    if let Err(e) = link.close() {
        tracing::warn!("close reported: {}", e);
    }

    let counters = link.counters();
    tracing::info!(
        "done: {} in / {} out / {} dropped, {} payloads delivered",
        counters.incoming_packets,
        counters.outgoing_packets,
        counters.error_packets,
        delegate.received.load(Ordering::Relaxed)
    );
    Ok(())
}
