use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Account address: an ed25519 public key, base58 encoded for display
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    /// Random address, for accounts nobody signs for
    pub fn new_unique() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self)
    }
}

impl FromStr for Pubkey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| anyhow!("Invalid base58 address {}: {}", s, e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("Address {} must decode to 32 bytes", s))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Pubkey::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Signing credential of one account
pub struct WalletKeypair {
    keypair: SigningKey,
}

impl WalletKeypair {
    /// Create a new random keypair
    pub fn new() -> Self {
        Self {
            keypair: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create keypair from base58 private key string (64 bytes: secret then public)
    pub fn from_base58_string(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| anyhow!("Invalid base58 private key: {}", e))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("Private key must decode to 64 bytes, got {}", b.len()))?;

        let keypair = SigningKey::from_keypair_bytes(&bytes)
            .map_err(|e| anyhow!("Invalid private key: {}", e))?;

        Ok(Self { keypair })
    }

    /// Get the public key
    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.keypair.verifying_key().to_bytes())
    }

    /// Get the base58 encoded private key
    pub fn to_base58_string(&self) -> String {
        bs58::encode(self.keypair.to_keypair_bytes()).into_string()
    }

    /// Sign a message
    pub fn sign_message(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

impl Default for WalletKeypair {
    fn default() -> Self {
        Self::new()
    }
}

// never print the secret half
impl fmt::Debug for WalletKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeypair")
            .field("pubkey", &self.pubkey())
            .finish()
    }
}
