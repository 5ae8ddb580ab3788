//! Wallet management for keypair loading and transaction signing.

use anyhow::{anyhow, Result};
use solana_sdk::{
    message::VersionedMessage,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::VersionedTransaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Wallet manager for handling keypair operations
#[derive(Debug)]
pub struct WalletManager {
    keypair: Keypair,
}

impl WalletManager {
    /// Load a keypair file; a leading `~` is expanded to the home directory.
    pub fn from_file<P: AsRef<Path>>(keypair_path: P) -> Result<Self> {
        let path = expand_home(keypair_path.as_ref());
        let keypair_data = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read keypair file {}: {}", path.display(), e))?;

        let keypair = Self::parse_keypair(&keypair_data)?;

        info!("Loaded keypair from {}, pubkey: {}", path.display(), keypair.pubkey());

        Ok(Self { keypair })
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        Self { keypair }
    }

    /// Generate a new random keypair for testing
    pub fn new_random() -> Self {
        let keypair = Keypair::new();
        debug!("Generated random keypair, pubkey: {}", keypair.pubkey());
        Self { keypair }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Sign a compiled message, producing a fully signed transaction.
    pub fn sign_message(&self, message: VersionedMessage) -> Result<VersionedTransaction> {
        let tx = VersionedTransaction::try_new(message, &[&self.keypair])
            .map_err(|e| anyhow!("Failed to sign transaction: {}", e))?;
        debug!("Transaction signed with pubkey: {}", self.keypair.pubkey());
        Ok(tx)
    }

    /// Re-sign an externally built transaction whose only signer is this wallet.
    pub fn sign_transaction(&self, tx: VersionedTransaction) -> Result<VersionedTransaction> {
        self.sign_message(tx.message)
    }

    /// Parse keypair from string (supports both JSON array and base58 formats)
    fn parse_keypair(data: &str) -> Result<Keypair> {
        let data = data.trim();

        // Solana CLI format
        if data.starts_with('[') && data.ends_with(']') {
            let bytes: Vec<u8> = serde_json::from_str(data)
                .map_err(|e| anyhow!("Failed to parse keypair JSON array: {}", e))?;

            if bytes.len() != 64 {
                return Err(anyhow!("Invalid keypair: expected 64 bytes, got {}", bytes.len()));
            }

            let keypair = Keypair::from_bytes(&bytes)
                .map_err(|e| anyhow!("Failed to create keypair from bytes: {}", e))?;

            return Ok(keypair);
        }

        if let Ok(bytes) = bs58::decode(data).into_vec() {
            if bytes.len() == 64 {
                if let Ok(keypair) = Keypair::from_bytes(&bytes) {
                    return Ok(keypair);
                }
            }
        }

        Err(anyhow!("Invalid keypair format: expected JSON array [byte, byte, ...] or base58 string"))
    }

    /// Save keypair to file in JSON format
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.keypair.to_bytes().to_vec())?;
        fs::write(&path, json)
            .map_err(|e| anyhow!("Failed to write keypair to {}: {}", path.as_ref().display(), e))?;

        info!("Saved keypair to {}", path.as_ref().display());
        Ok(())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    match (raw.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => {
            let mut expanded = PathBuf::from(home);
            expanded.push(rest.trim_start_matches('/'));
            expanded
        }
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::{hash::Hash, message::v0, system_instruction};
    use tempfile::NamedTempFile;

    #[test]
    fn test_keypair_from_json_array() {
        let keypair = Keypair::new();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap();

        let parsed_keypair = WalletManager::parse_keypair(&json).unwrap();
        assert_eq!(keypair.pubkey(), parsed_keypair.pubkey());
    }

    #[test]
    fn test_keypair_from_base58() {
        let keypair = Keypair::new();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();

        let parsed_keypair = WalletManager::parse_keypair(&encoded).unwrap();
        assert_eq!(keypair.pubkey(), parsed_keypair.pubkey());
    }

    #[test]
    fn test_short_json_array_is_rejected() {
        let err = WalletManager::parse_keypair("[1,2,3]").unwrap_err();
        assert!(err.to_string().contains("expected 64 bytes"));
    }

    #[test]
    fn test_save_and_load_keypair() {
        let temp_file = NamedTempFile::new().unwrap();
        let original_wallet = WalletManager::new_random();

        original_wallet.save_to_file(temp_file.path()).unwrap();
        let loaded_wallet = WalletManager::from_file(temp_file.path()).unwrap();

        assert_eq!(original_wallet.pubkey(), loaded_wallet.pubkey());
    }

    #[test]
    fn test_sign_message_produces_verifiable_signature() {
        let wallet = WalletManager::new_random();
        let payer = wallet.pubkey();
        let ix = system_instruction::transfer(&payer, &Pubkey::new_unique(), 1);
        let message = v0::Message::try_compile(&payer, &[ix], &[], Hash::new_unique()).unwrap();

        let tx = wallet.sign_message(VersionedMessage::V0(message)).unwrap();

        assert_eq!(tx.signatures.len(), 1);
        assert!(tx.verify_with_results().iter().all(|ok| *ok));
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_home(Path::new("~/.config/solana/id.json"));
            assert_eq!(expanded, PathBuf::from(home).join(".config/solana/id.json"));
        }
        assert_eq!(expand_home(Path::new("/abs/id.json")), PathBuf::from("/abs/id.json"));
    }
}
