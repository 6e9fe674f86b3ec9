//! clearcast: descrambling relay for encrypted IPTV multicast channels.
//!
//! Joins each channel's RTP multicast group, descrambles the MPEG-TS
//! payload with keys recovered from in-band ECMs, and re-serves the
//! cleartext stream over HTTP (or as unicast RTP).

use std::sync::Arc;

use clap::Parser;
use log::info;

mod catalog;
mod channel;
mod descramble;
mod logging;
mod web;

use catalog::Catalog;
use channel::ChannelRegistry;
use web::state::AppState;

/// clearcast - re-serve encrypted IPTV multicast channels in the clear
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Multicast-capable network interface
    #[arg(short = 'i', long = "interface", default_value = "eth0")]
    interface: String,

    /// Channel catalog URL; without it no channels are loaded
    #[arg(short = 'c', long = "catalog-url")]
    catalog_url: Option<String>,

    /// Listen address (host:port) for the HTTP server
    #[arg(short = 'a', long = "http-addr", default_value = "localhost:8080")]
    http_addr: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    logging::init(args.verbose)?;

    let ifindex = match nix::net::if_::if_nametoindex(args.interface.as_str()) {
        Ok(index) => index,
        Err(_) => {
            eprintln!("No such network interface: {}", args.interface);
            std::process::exit(1);
        }
    };

    let catalog = Arc::new(Catalog::new());
    if let Some(url) = args.catalog_url {
        catalog::spawn_refresh(Arc::clone(&catalog), url);
    }

    let registry = Arc::new(ChannelRegistry::new(ifindex));
    let state = Arc::new(AppState {
        catalog,
        registry,
        http_addr: args.http_addr.clone(),
    });

    info!(
        "starting HTTP server on {}, multicast interface: {}",
        args.http_addr, args.interface
    );
    web::start_web_server(&args.http_addr, state).await
}
