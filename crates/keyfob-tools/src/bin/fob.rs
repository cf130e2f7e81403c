//! Fob simulator: connects to a car on TCP and reads operator commands from stdin.

use anyhow::Result;
use clap::Parser;
use keyfob_core::{Fob, FobShell};
use keyfob_platform::file::FileStore;
use keyfob_tools::{logging, FobProvisioning};
use keyfob_transport::{TcpChannel, TcpEndpoint};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fob")]
#[command(about = "Key fob device simulator")]
#[command(version)]
struct Args {
    /// Provisioning file written by `keyfob-tool provision-fob`
    #[arg(short, long)]
    provisioning: PathBuf,

    /// Persisted fob state
    #[arg(short, long)]
    state: PathBuf,

    /// Address of the car or of the fob being paired
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    connect: String,

    /// Wait for a peer here instead of connecting (the paired side dials
    /// an unpaired fob listening with this)
    #[arg(short, long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 50)]
    retries: u32,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let provisioning = FobProvisioning::load(&args.provisioning)?;
    let config = provisioning.session_config()?;
    let factory = provisioning.factory_state()?;

    let channel = match &args.listen {
        Some(addr) => TcpEndpoint::server(addr.as_str())?.accept()?,
        None => TcpChannel::connect_with_retry(
            args.connect.as_str(),
            args.retries,
            Duration::from_millis(100),
        )?,
    };
    let mut fob = Fob::boot(channel, FileStore::new(&args.state), move || factory, config)?;

    let stdin = io::stdin();
    let mut shell = FobShell::new(&mut fob, stdin.lock(), io::stdout());
    shell.run()?;
    Ok(())
}
