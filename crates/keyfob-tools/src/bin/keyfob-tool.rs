//! Offline tooling: keys, feature grants and provisioning files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keyfob_crypto::SharedSecret;
use keyfob_tools::{authority, logging, CarProvisioning, FobPairing, FobProvisioning};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keyfob-tool")]
#[command(about = "Key, grant and provisioning tooling for the car/fob access protocol")]
#[command(version)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh 32-byte shared secret as hex, or write it to a file
    GenSecret {
        /// Output file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Generate the feature authority key pair
    GenKeypair {
        /// Secret key output file
        secret_key: PathBuf,
        /// Public key output file
        public_key: PathBuf,
    },
    /// Sign a feature grant and write the hex package
    SignFeature {
        /// Car the feature is granted to
        car_id: u32,
        /// Feature number
        feature_id: u8,
        /// Authority secret key file
        secret_key: PathBuf,
        /// Package output file
        out: PathBuf,
    },
    /// Check a package against the authority public key (exit status 1 if invalid)
    VerifyFeature {
        /// Authority public key file
        public_key: PathBuf,
        /// Package file
        package: PathBuf,
    },
    /// Write a car provisioning file
    ProvisionCar {
        /// Car identity
        #[arg(long)]
        car_id: u32,
        /// Shared secret file (hex)
        #[arg(long)]
        secret: PathBuf,
        /// Authority public key file
        #[arg(long)]
        public_key: PathBuf,
        /// Message revealed on unlock
        #[arg(long)]
        unlock_message: String,
        /// Message revealed for the next feature number; repeat in order
        #[arg(long = "feature-message")]
        feature_messages: Vec<String>,
        /// Hardened-mode protocol timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Output file
        out: PathBuf,
    },
    /// Write a fob provisioning file; give --car-id to build it paired
    ProvisionFob {
        /// Car a paired fob belongs to
        #[arg(long, requires_all = ["pin", "secret"])]
        car_id: Option<u32>,
        /// Six-character pairing PIN
        #[arg(long)]
        pin: Option<String>,
        /// Shared secret file (hex)
        #[arg(long)]
        secret: Option<PathBuf>,
        /// Authority public key file
        #[arg(long)]
        public_key: PathBuf,
        /// Hardened-mode protocol timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Output file
        out: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Commands::GenSecret { out } => {
            let secret = authority::gen_secret();
            match out {
                Some(path) => fs::write(&path, format!("{}\n", secret.as_str()))
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", secret.as_str()),
            }
        }
        Commands::GenKeypair {
            secret_key,
            public_key,
        } => {
            let public_hex = authority::gen_keypair(&secret_key, &public_key)?;
            println!("{}", public_hex);
        }
        Commands::SignFeature {
            car_id,
            feature_id,
            secret_key,
            out,
        } => {
            authority::sign_feature(car_id, feature_id, &secret_key, &out)?;
            info!(car_id, feature_id, "feature package written");
        }
        Commands::VerifyFeature {
            public_key,
            package,
        } => match authority::verify_feature(&public_key, &package) {
            Ok(p) => println!("valid: car {} feature {}", p.car_id, p.feature_id),
            Err(e) => {
                error!("{:#}", e);
                println!("invalid");
                return Ok(ExitCode::FAILURE);
            }
        },
        Commands::ProvisionCar {
            car_id,
            secret,
            public_key,
            unlock_message,
            feature_messages,
            timeout_ms,
            out,
        } => {
            let provisioning = CarProvisioning {
                car_id,
                shared_secret: read_secret(&secret)?,
                authority_public_key: authority::load_public_key(&public_key)?.to_hex(),
                unlock_message,
                feature_messages,
                protocol_timeout_ms: timeout_ms,
            };
            provisioning.session_config()?;
            provisioning.record()?;
            provisioning.save(&out)?;
        }
        Commands::ProvisionFob {
            car_id,
            pin,
            secret,
            public_key,
            timeout_ms,
            out,
        } => {
            let paired = match (car_id, pin, secret) {
                (Some(car_id), Some(pin), Some(secret)) => Some(FobPairing {
                    car_id,
                    pin,
                    shared_secret: read_secret(&secret)?,
                }),
                (None, None, None) => None,
                _ => bail!("a paired fob needs --car-id, --pin and --secret"),
            };
            let provisioning = FobProvisioning {
                paired,
                authority_public_key: authority::load_public_key(&public_key)?.to_hex(),
                protocol_timeout_ms: timeout_ms,
            };
            provisioning.factory_state()?;
            provisioning.save(&out)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Reads and validates a shared secret file, returning canonical hex.
fn read_secret(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let secret = SharedSecret::from_hex(text.trim())
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(secret.to_hex().to_string())
}
