use crate::app::TransferPlan;
use crate::wallet::keypair::{Pubkey, WalletKeypair};
use crate::wallet::rpc::AssetKind;
use crate::wallet::transaction::DispatchPolicy;
use crate::wallet::units::{to_base_units, MAX_DECIMALS};
use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "fanout.json";

/// How pipelines are scheduled against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// One pipeline after another
    Sequential,
    /// All pipelines at once, with staggered starts
    Parallel,
}

/// Run configuration, read once at start and shared read-only afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rpc_url: String,
    /// base58 keypair of the funding account
    pub funding_key: Option<String>,
    pub destination: String,
    pub token_contract: String,
    pub token_decimals: u32,
    pub native_decimals: u32,
    pub account_count: usize,
    pub token_amount: Decimal,
    pub fee_reserve: Decimal,
    pub mode: ConcurrencyMode,
    pub max_in_flight: Option<usize>,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub fee_escalation_factor: Decimal,
    /// Highest fee bid any dispatch may escalate to, in native base units
    pub fee_budget: Option<u64>,
    pub stagger_ms: u64,
    pub settle_delay_ms: u64,
    pub read_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub accounts_dir: PathBuf,
    pub preflight: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            funding_key: None,
            destination: String::new(),
            token_contract: String::new(),
            token_decimals: 6,
            native_decimals: 18,
            account_count: 40,
            token_amount: Decimal::ONE,
            fee_reserve: Decimal::new(1, 1),
            mode: ConcurrencyMode::Sequential,
            max_in_flight: None,
            max_attempts: 5,
            poll_interval_ms: 10_000,
            max_poll_attempts: 300,
            fee_escalation_factor: Decimal::new(110, 2),
            fee_budget: None,
            stagger_ms: 1_000,
            settle_delay_ms: 10_000,
            read_attempts: 3,
            read_retry_delay_ms: 1_000,
            request_timeout_ms: 30_000,
            accounts_dir: PathBuf::from("wallets"),
            preflight: true,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(settings)
    }

    /// Write the settings, refusing to replace an existing file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            bail!("Config file {} already exists", path.display());
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Checks everything a `send` run depends on
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.trim().is_empty() {
            bail!("rpc_url is not set");
        }
        self.destination()?;
        self.token_asset()?;
        if self.account_count == 0 {
            bail!("account_count must be at least 1");
        }
        if self.token_decimals > MAX_DECIMALS || self.native_decimals > MAX_DECIMALS {
            bail!("decimals must not exceed {}", MAX_DECIMALS);
        }
        if self.token_amount <= Decimal::ZERO {
            bail!("token_amount must be positive");
        }
        if self.fee_reserve <= Decimal::ZERO {
            bail!("fee_reserve must be positive");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.max_poll_attempts == 0 {
            bail!("max_poll_attempts must be at least 1");
        }
        if self.read_attempts == 0 {
            bail!("read_attempts must be at least 1");
        }
        if self.max_in_flight == Some(0) {
            bail!("max_in_flight must be at least 1 when set");
        }
        self.fee_escalation_bps()?;
        self.token_base_units()?;
        self.fee_reserve_base_units()?;
        Ok(())
    }

    pub fn destination(&self) -> Result<Pubkey> {
        if self.destination.trim().is_empty() {
            bail!("destination is not set");
        }
        Pubkey::from_str(&self.destination).context("Invalid destination address")
    }

    pub fn token_asset(&self) -> Result<AssetKind> {
        let contract = self.token_contract.trim();
        if contract.is_empty() {
            bail!("token_contract is not set");
        }
        Ok(AssetKind::Token {
            contract: contract.to_string(),
        })
    }

    /// `override_key` (flag or environment) wins over the config file
    pub fn funding_keypair(&self, override_key: Option<&str>) -> Result<WalletKeypair> {
        let key = override_key
            .or(self.funding_key.as_deref())
            .ok_or_else(|| anyhow!("No funding key: set funding_key or FANOUT_FUNDING_KEY"))?;
        WalletKeypair::from_base58_string(key).context("Invalid funding key")
    }

    /// Escalation factor as basis points (1.10 -> 11_000)
    pub fn fee_escalation_bps(&self) -> Result<u32> {
        if self.fee_escalation_factor <= Decimal::ONE {
            bail!(
                "fee_escalation_factor must be greater than 1, got {}",
                self.fee_escalation_factor
            );
        }
        (self.fee_escalation_factor * Decimal::from(10_000))
            .round()
            .to_u32()
            .ok_or_else(|| anyhow!("fee_escalation_factor {} is too large", self.fee_escalation_factor))
    }

    pub fn token_base_units(&self) -> Result<u128> {
        to_base_units(self.token_amount, self.token_decimals).context("Invalid token_amount")
    }

    pub fn fee_reserve_base_units(&self) -> Result<u128> {
        to_base_units(self.fee_reserve, self.native_decimals).context("Invalid fee_reserve")
    }

    pub fn dispatch_policy(&self) -> Result<DispatchPolicy> {
        Ok(DispatchPolicy {
            max_attempts: self.max_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_attempts: self.max_poll_attempts,
            fee_escalation_bps: self.fee_escalation_bps()?,
            fee_budget: self.fee_budget.map(u128::from),
            read_attempts: self.read_attempts,
            read_retry_delay: Duration::from_millis(self.read_retry_delay_ms),
        })
    }

    pub fn transfer_plan(&self) -> Result<TransferPlan> {
        Ok(TransferPlan {
            destination: self.destination()?,
            token: self.token_asset()?,
            token_amount: self.token_base_units()?,
            fee_reserve: self.fee_reserve_base_units()?,
            mode: self.mode,
            stagger: Duration::from_millis(self.stagger_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            max_in_flight: self.max_in_flight,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
