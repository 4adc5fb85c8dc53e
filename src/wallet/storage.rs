use crate::wallet::{account::Account, keypair::WalletKeypair};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;
const SEAL_VERSION: u32 = 1;
const RECORD_EXTENSION: &str = "json";

/// Credential sealed with a password-derived key
#[derive(Debug, Serialize, Deserialize)]
pub struct SealedKey {
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub version: u32,
}

/// One persisted account file. Exactly one of `private_key` / `sealed_key` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_key: Option<SealedKey>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Drop for AccountRecord {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Persists generated accounts, one `<address>.json` file each
pub struct AccountStore {
    dir: PathBuf,
    password: Option<Zeroizing<String>>,
}

impl AccountStore {
    /// Open (and create if missing) the accounts directory
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create accounts directory {}", dir.display()))?;
        }

        Ok(Self {
            dir,
            password: None,
        })
    }

    /// Seal credentials written from now on, and unseal on load
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Generate `count` fresh accounts and persist each of them
    pub fn create_accounts(&self, count: usize) -> Result<Vec<Account>> {
        info!(count, dir = %self.dir.display(), "Creating accounts");

        let mut accounts = Vec::with_capacity(count);
        for _ in 0..count {
            let account = Account::generate();
            self.save(&account)?;
            info!(account = %account.address, "New account created and saved");
            accounts.push(account);
        }

        Ok(accounts)
    }

    /// Write an account record. Existing records are never overwritten.
    pub fn save(&self, account: &Account) -> Result<()> {
        let private_key = Zeroizing::new(account.credential.to_base58_string());

        let mut record = AccountRecord {
            address: account.address.to_string(),
            private_key: None,
            sealed_key: None,
            created_at: Some(account.created_at),
        };
        match &self.password {
            Some(password) => record.sealed_key = Some(seal(private_key.as_bytes(), password)?),
            None => record.private_key = Some(private_key.to_string()),
        }

        let file_path = self.record_path(&record.address);
        let content = serde_json::to_vec_pretty(&record)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)
            .with_context(|| format!("Failed to create account file {}", file_path.display()))?;
        file.write_all(&content)?;

        Ok(())
    }

    /// Every parsable record in the directory, sorted by address.
    ///
    /// Files that cannot be read or parsed are skipped with a warning.
    pub fn list_records(&self) -> Result<Vec<AccountRecord>> {
        let mut records = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != RECORD_EXTENSION) {
                continue;
            }

            let parsed = std::fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| serde_json::from_slice::<AccountRecord>(&bytes).map_err(Into::into));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %path.display(), "Error parsing account file: {}", e),
            }
        }

        records.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(records)
    }

    /// Load every account whose credential can be recovered
    pub fn load_accounts(&self) -> Result<Vec<Account>> {
        let records = self.list_records()?;
        let mut accounts = Vec::with_capacity(records.len());

        for record in &records {
            match self.recover(record) {
                Ok(account) => accounts.push(account),
                Err(e) => warn!(account = %record.address, "Skipping account: {}", e),
            }
        }

        Ok(accounts)
    }

    fn recover(&self, record: &AccountRecord) -> Result<Account> {
        let credential = match (&record.private_key, &record.sealed_key) {
            (Some(private_key), _) => WalletKeypair::from_base58_string(private_key)?,
            (None, Some(sealed)) => {
                let password = self
                    .password
                    .as_ref()
                    .ok_or_else(|| anyhow!("Credential is sealed and no password is set"))?;
                let plaintext = Zeroizing::new(unseal(sealed, password)?);
                let private_key = std::str::from_utf8(&plaintext)
                    .map_err(|_| anyhow!("Sealed credential is not valid UTF-8"))?;
                WalletKeypair::from_base58_string(private_key)?
            }
            (None, None) => return Err(anyhow!("Record has no credential")),
        };

        if credential.pubkey().to_string() != record.address {
            return Err(anyhow!("Credential does not match address"));
        }

        let mut account = Account::from_keypair(credential);
        if let Some(created_at) = record.created_at {
            account.created_at = created_at;
        }
        Ok(account)
    }

    fn record_path(&self, address: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", address, RECORD_EXTENSION))
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, key_bytes.as_mut_slice())
        .map_err(|e| anyhow!("Failed to derive key: {:?}", e))?;
    Ok(key_bytes)
}

fn seal(plaintext: &[u8], password: &str) -> Result<SealedKey> {
    let mut salt = vec![0u8; SALT_SIZE];
    thread_rng().fill_bytes(&mut salt);
    let key_bytes = derive_key(password, &salt)?;
    let key = Key::<Aes256Gcm>::from_slice(key_bytes.as_slice());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = Aes256Gcm::new(key)
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(SealedKey {
        salt,
        nonce: nonce_bytes.to_vec(),
        ciphertext,
        version: SEAL_VERSION,
    })
}

fn unseal(sealed: &SealedKey, password: &str) -> Result<Vec<u8>> {
    if sealed.version != SEAL_VERSION {
        return Err(anyhow!("Unsupported sealed key version {}", sealed.version));
    }
    if sealed.nonce.len() != NONCE_SIZE {
        return Err(anyhow!("Corrupted sealed key"));
    }

    let key_bytes = derive_key(password, &sealed.salt)?;
    let key = Key::<Aes256Gcm>::from_slice(key_bytes.as_slice());
    let nonce = Nonce::from_slice(&sealed.nonce);

    Aes256Gcm::new(key)
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|_| anyhow!("Invalid password or corrupted data"))
}
