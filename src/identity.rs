//! Validator identity keypairs.
//!
//! Each host is configured with the same two keypairs: the active (voting)
//! identity and the passive (standby) identity. Which one the validator is
//! currently advertising in gossip decides its role.

use {
    crate::{
        error::{Error, Result},
        utils,
    },
    log::debug,
    solana_keypair::{read_keypair_file, Keypair},
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::path::PathBuf,
};

/// A keypair loaded from a solana-keygen file.
#[derive(Debug)]
pub struct Identity {
    pub key_file: PathBuf,
    pub keypair: Keypair,
}

impl Identity {
    /// Load an identity from a keypair file, expanding `~` in the path.
    pub fn load(key_file: &str) -> Result<Self> {
        let resolved = utils::resolve_path(key_file)?;
        debug!("reading solana keygen file {}", resolved.display());

        let keypair = read_keypair_file(&resolved).map_err(|err| {
            Error::Configuration(format!(
                "failed to parse keygen file {}: {err}",
                resolved.display()
            ))
        })?;

        debug!(
            "parsed solana keygen file {} pubkey {}",
            resolved.display(),
            keypair.pubkey()
        );

        Ok(Self {
            key_file: resolved,
            keypair,
        })
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn key_file_string(&self) -> String {
        self.key_file.display().to_string()
    }
}

/// The active/passive identity pair. The two public keys must differ;
/// construction rejects equality outright.
#[derive(Debug)]
pub struct IdentityPair {
    pub active: Identity,
    pub passive: Identity,
}

impl IdentityPair {
    pub fn load(active_key_file: &str, passive_key_file: &str) -> Result<Self> {
        let active = Identity::load(active_key_file)?;
        let passive = Identity::load(passive_key_file)?;

        if active.pubkey() == passive.pubkey() {
            return Err(Error::Configuration(
                "active and passive identities must be different".to_string(),
            ));
        }

        Ok(Self { active, passive })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, solana_keypair::write_keypair_file, tempfile::TempDir};

    fn write_test_keypair(dir: &TempDir, name: &str) -> (Keypair, String) {
        let keypair = Keypair::new();
        let path = dir.path().join(name);
        write_keypair_file(&keypair, &path).unwrap();
        (keypair, path.display().to_string())
    }

    #[test]
    fn test_load_identity() {
        let dir = TempDir::new().unwrap();
        let (keypair, path) = write_test_keypair(&dir, "active.json");

        let identity = Identity::load(&path).unwrap();
        assert_eq!(identity.pubkey(), keypair.pubkey());
        assert!(identity.key_file.is_absolute());
    }

    #[test]
    fn test_load_identity_missing_file() {
        let err = Identity::load("/nonexistent/identity.json").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_pair_rejects_identical_identities() {
        let dir = TempDir::new().unwrap();
        let (_, path) = write_test_keypair(&dir, "same.json");

        let err = IdentityPair::load(&path, &path).unwrap_err();
        assert!(err.to_string().contains("must be different"));
    }

    #[test]
    fn test_pair_loads_distinct_identities() {
        let dir = TempDir::new().unwrap();
        let (active, active_path) = write_test_keypair(&dir, "active.json");
        let (passive, passive_path) = write_test_keypair(&dir, "passive.json");

        let pair = IdentityPair::load(&active_path, &passive_path).unwrap();
        assert_eq!(pair.active.pubkey(), active.pubkey());
        assert_eq!(pair.passive.pubkey(), passive.pubkey());
    }
}
