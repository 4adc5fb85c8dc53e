use crate::wallet::keypair::{Pubkey, WalletKeypair};
use chrono::{DateTime, Utc};

/// A generated account: its address and the credential that signs for it.
///
/// Accounts are created once, persisted once and never mutated afterwards.
#[derive(Debug)]
pub struct Account {
    pub address: Pubkey,
    pub credential: WalletKeypair,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a fresh account with a random keypair
    pub fn generate() -> Self {
        Self::from_keypair(WalletKeypair::new())
    }

    /// Wrap an existing keypair
    pub fn from_keypair(credential: WalletKeypair) -> Self {
        Self {
            address: credential.pubkey(),
            credential,
            created_at: Utc::now(),
        }
    }

    /// Shortened address for log lines (first 4 and last 4 chars)
    pub fn short_address(&self) -> String {
        short_address(&self.address)
    }
}

pub fn short_address(address: &Pubkey) -> String {
    let address = address.to_string();
    if address.len() > 8 {
        format!("{}...{}", &address[..4], &address[address.len() - 4..])
    } else {
        address
    }
}
