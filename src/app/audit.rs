use crate::wallet::keypair::Pubkey;
use crate::wallet::rpc::{AssetKind, LedgerClient};
use crate::wallet::storage::AccountStore;
use crate::wallet::units::from_base_units;
use anyhow::Result;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Balances of one persisted account, in whole units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub address: Pubkey,
    pub native: Decimal,
    pub token: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub balances: Vec<AccountBalance>,
    pub total_native: Decimal,
    pub total_token: Decimal,
    /// Records whose address could not be parsed
    pub skipped: usize,
}

/// Read-only balance report over every persisted account
pub struct BalanceAuditor {
    ledger: Arc<dyn LedgerClient>,
    token: AssetKind,
    token_decimals: u32,
    native_decimals: u32,
}

impl BalanceAuditor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        token: AssetKind,
        token_decimals: u32,
        native_decimals: u32,
    ) -> Self {
        Self {
            ledger,
            token,
            token_decimals,
            native_decimals,
        }
    }

    pub async fn audit(&self, store: &AccountStore) -> Result<AuditReport> {
        let records = store.list_records()?;
        let mut report = AuditReport::default();

        let mut addresses = Vec::with_capacity(records.len());
        for record in &records {
            match Pubkey::from_str(&record.address) {
                Ok(address) => addresses.push(address),
                Err(e) => {
                    warn!(address = %record.address, "Skipping account: {}", e);
                    report.skipped += 1;
                }
            }
        }
        info!(accounts = addresses.len(), dir = %store.path().display(), "Checking balances");

        let balances = join_all(addresses.iter().map(|address| self.account_balance(*address))).await;
        for balance in balances {
            report.total_native += balance.native;
            report.total_token += balance.token;
            report.balances.push(balance);
        }

        Ok(report)
    }

    async fn account_balance(&self, address: Pubkey) -> AccountBalance {
        let (native, token) = tokio::join!(
            self.read(&address, &AssetKind::Native, self.native_decimals),
            self.read(&address, &self.token, self.token_decimals),
        );
        AccountBalance {
            address,
            native,
            token,
        }
    }

    /// A failed read is logged and counts as zero
    async fn read(&self, address: &Pubkey, asset: &AssetKind, decimals: u32) -> Decimal {
        let units = match self.ledger.balance(address, asset).await {
            Ok(units) => units,
            Err(e) => {
                warn!(account = %address, asset = %asset, "Error checking balance: {}", e);
                return Decimal::ZERO;
            }
        };

        from_base_units(units, decimals).unwrap_or_else(|e| {
            warn!(account = %address, asset = %asset, "Balance out of range: {}", e);
            Decimal::ZERO
        })
    }
}
