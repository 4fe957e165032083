//! knx-monitor: connect to a KNX gateway and log every telegram on the bus.
//!
//! ```text
//! knx-monitor [--config FILE] [--remote IP:PORT] [--local IP] [--nat] [--routing]
//! ```
//!
//! Without `--remote` or a `remote_endpoint` in the configuration file the
//! first gateway answering a search is used. Set `RUST_LOG=debug` for
//! protocol details.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use knx_link::protocol::{Body, Frame};
use knx_link::{Config, KnxClient, KnxError, Plugin, TransportMode};

/// Logs the telegram carried by every incoming tunneling request or routing
/// indication
#[derive(Debug)]
struct BusLogger;

impl Plugin for BusLogger {
    fn name(&self) -> &str {
        "bus-logger"
    }

    fn on_start(&self) {
        log::info!("Monitoring bus traffic, press Ctrl-C to stop");
    }

    fn on_incoming_frame(&self, frame: &Frame) {
        let cemi = match frame.body() {
            Body::TunnelingRequest(request) => &request.cemi,
            Body::RoutingIndication(indication) => &indication.cemi,
            _ => return,
        };
        log::info!("{cemi}");
    }

    fn on_error(&self, error: &KnxError) {
        log::warn!("{error}");
    }
}

fn usage() -> ! {
    eprintln!("usage: knx-monitor [--config FILE] [--remote IP:PORT] [--local IP] [--nat] [--routing]");
    std::process::exit(2);
}

fn parse_args() -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || args.next().unwrap_or_else(|| usage());
        match arg.as_str() {
            "--config" => {
                let text = std::fs::read_to_string(value())?;
                config = Config::from_properties(&text)?;
            }
            "--remote" => config = config.with_remote_endpoint(value().parse::<SocketAddrV4>()?),
            "--local" => config = config.with_local_address(value().parse::<Ipv4Addr>()?),
            "--nat" => config = config.with_nat(true),
            "--routing" => config = config.with_mode(TransportMode::Routing),
            "-h" | "--help" => usage(),
            _ => {
                eprintln!("unknown argument: {arg}");
                usage();
            }
        }
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = parse_args()?;
    let client = KnxClient::builder()
        .config(config)
        .plugin(Arc::new(BusLogger))
        .build()?;
    if let Some(channel_id) = client.channel_id() {
        log::info!("Tunnel open on channel {channel_id}");
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    while running.load(Ordering::SeqCst) && client.is_connected() {
        std::thread::sleep(Duration::from_millis(200));
    }
    if !client.is_connected() {
        log::warn!("Connection lost");
    }

    let stats = client.statistics_snapshot();
    let clean = client.close();
    log::info!(
        "Closed{}: {} frames in, {} frames out, {} errors",
        if clean { "" } else { " (unclean)" },
        stats.frames_in,
        stats.frames_out,
        stats.errors
    );
    Ok(())
}
