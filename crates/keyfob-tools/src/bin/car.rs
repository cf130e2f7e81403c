//! Car simulator: listens for a fob on TCP and prints revealed messages on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use keyfob_core::Car;
use keyfob_platform::file::FileStore;
use keyfob_tools::{logging, CarProvisioning};
use keyfob_transport::TcpEndpoint;
use rand::rngs::OsRng;
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "car")]
#[command(about = "Car device simulator")]
#[command(version)]
struct Args {
    /// Provisioning file written by `keyfob-tool provision-car`
    #[arg(short, long)]
    provisioning: PathBuf,

    /// Persisted car record
    #[arg(short, long)]
    state: PathBuf,

    /// Address to accept the fob on
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    listen: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let provisioning = CarProvisioning::load(&args.provisioning)?;
    let config = provisioning.session_config()?;
    let factory = provisioning.record()?;
    let endpoint = TcpEndpoint::server(args.listen.as_str())
        .with_context(|| format!("binding {}", args.listen))?;

    loop {
        let channel = endpoint.accept()?;
        let peer = channel.peer_addr();
        let factory = factory.clone();
        let mut car = Car::boot(
            provisioning.car_id,
            channel,
            FileStore::new(&args.state),
            move || factory,
            config.clone(),
            OsRng,
            io::stdout(),
        )?;
        match car.run() {
            Err(e) if e.is_disconnect() => info!(%peer, "fob disconnected"),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
    }
}
