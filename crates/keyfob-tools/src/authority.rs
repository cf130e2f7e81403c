//! Offline feature-authority operations.
//!
//! Key files and package files hold a single hex line.

use anyhow::{Context, Result};
use keyfob_core::FeaturePackage;
use keyfob_crypto::{AuthorityKeyPair, AuthorityPublicKey, SharedSecret};
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Fresh board-link shared secret, hex.
pub fn gen_secret() -> Zeroizing<String> {
    SharedSecret::generate().to_hex()
}

/// Generates an authority key pair and writes both halves.
///
/// # Returns
/// The public key, hex.
pub fn gen_keypair(secret_key_path: &Path, public_key_path: &Path) -> Result<String> {
    let pair = AuthorityKeyPair::generate();
    let secret_hex = Zeroizing::new(format!("{}\n", hex::encode(&pair.secret_bytes()[..])));
    fs::write(secret_key_path, secret_hex.as_bytes())
        .with_context(|| format!("writing {}", secret_key_path.display()))?;
    let public_hex = pair.public_key().to_hex();
    fs::write(public_key_path, format!("{}\n", public_hex))
        .with_context(|| format!("writing {}", public_key_path.display()))?;
    Ok(public_hex)
}

/// Reads an authority secret key file.
pub fn load_keypair(path: &Path) -> Result<AuthorityKeyPair> {
    let text = Zeroizing::new(
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
    );
    AuthorityKeyPair::from_hex(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Reads an authority public key file.
pub fn load_public_key(path: &Path) -> Result<AuthorityPublicKey> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    AuthorityPublicKey::from_hex(text.trim())
        .with_context(|| format!("parsing {}", path.display()))
}

/// Signs a grant of `feature_id` to `car_id` and writes the package file.
pub fn sign_feature(
    car_id: u32,
    feature_id: u8,
    secret_key_path: &Path,
    out: &Path,
) -> Result<FeaturePackage> {
    let pair = load_keypair(secret_key_path)?;
    let package = FeaturePackage::sign(&pair, car_id, feature_id);
    fs::write(out, format!("{}\n", package.to_hex()))
        .with_context(|| format!("writing {}", out.display()))?;
    Ok(package)
}

/// Checks a package file against a public key file.
///
/// # Errors
///
/// Unreadable files, a malformed package, or a signature that does not
/// verify.
pub fn verify_feature(public_key_path: &Path, package_path: &Path) -> Result<FeaturePackage> {
    let authority = load_public_key(public_key_path)?;
    let text = fs::read_to_string(package_path)
        .with_context(|| format!("reading {}", package_path.display()))?;
    let package = FeaturePackage::from_hex(&text).context("feature package")?;
    package.verify(&authority).context("signature")?;
    Ok(package)
}
