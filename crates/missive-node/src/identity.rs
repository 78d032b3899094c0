//! The node's long-lived identity key on disk.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use missive_shared::identity::Identity;

/// Load the hex-encoded secret key at `path`, generating and saving a new
/// one if the file does not exist.
pub fn load_or_create(path: &Path) -> anyhow::Result<Identity> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity from {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("identity file is not hex")?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity file must hold 32 bytes"))?;
        return Ok(Identity::from_secret_bytes(&secret));
    }

    let identity = Identity::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(identity.secret_bytes()))
        .with_context(|| format!("writing identity to {}", path.display()))?;
    info!(path = %path.display(), "generated new node identity");
    Ok(identity)
}
