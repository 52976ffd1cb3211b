//! `drawlatch generate-keys <dir>` — mint an identity bundle.

use std::path::Path;

use dl_crypto::KeyBundle;

/// Generate a bundle into `dir` and print its fingerprint.  Refuses to
/// overwrite an existing bundle.
pub fn generate(dir: &Path) -> anyhow::Result<()> {
    if dir.join("signing.key").exists() {
        anyhow::bail!(
            "{} already contains a key bundle; refusing to overwrite",
            dir.display()
        );
    }
    let bundle = KeyBundle::generate();
    bundle
        .save(dir)
        .map_err(|e| anyhow::anyhow!("saving keys to {}: {e}", dir.display()))?;

    eprintln!("  Generated key bundle in {}", dir.display());
    eprintln!("  Fingerprint: {}", bundle.fingerprint());
    eprintln!();
    eprintln!("  Share <dir>/signing.pub + exchange.pub (as one .pub bundle)");
    eprintln!("  with peers; keep the .key files private (mode 0600).");
    Ok(())
}
