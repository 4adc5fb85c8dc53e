use crate::wallet::keypair::Pubkey;
use crate::wallet::transaction::SignedTransfer;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

// JSON-RPC error codes returned by the ledger for submissions
pub const CODE_SERVER_ERROR: i64 = -32000;
pub const CODE_FEE_TOO_LOW: i64 = -32010;
pub const CODE_REPLACEMENT_UNDERPRICED: i64 = -32011;
pub const CODE_SEQUENCE_TOO_LOW: i64 = -32012;
pub const CODE_SEQUENCE_EXPIRED: i64 = -32013;
pub const CODE_INSUFFICIENT_FUNDS: i64 = -32003;

/// Asset moved by a transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetKind {
    /// The ledger's native currency, which also pays fees
    Native,
    /// A fungible token identified by its contract
    Token { contract: String },
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Native => write!(f, "native"),
            AssetKind::Token { contract } => write!(f, "token:{}", contract),
        }
    }
}

/// Which view of the account sequence to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTag {
    Latest,
}

/// Ledger-issued handle of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHandle(pub String);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Failed,
}

/// Proof that a submission was finalized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub handle: TxHandle,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub block: Option<u64>,
}

/// Classification of a ledger failure, decided once when the error is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    /// The fee bid was rejected as insufficient, including replacement of a pending submission
    FeeTooLow,
    /// The submitted sequence is below the account's current sequence
    SequenceStale,
    /// Any other rejection by the ledger
    Rejected,
    /// The request never produced a ledger answer
    Transport,
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("fee too low: {0}")]
    FeeTooLow(String),

    #[error("sequence stale: {0}")]
    SequenceStale(String),

    #[error("rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("transport: {0}")]
    Transport(String),
}

impl LedgerError {
    pub fn kind(&self) -> LedgerErrorKind {
        match self {
            LedgerError::FeeTooLow(_) => LedgerErrorKind::FeeTooLow,
            LedgerError::SequenceStale(_) => LedgerErrorKind::SequenceStale,
            LedgerError::Rejected { .. } => LedgerErrorKind::Rejected,
            LedgerError::Transport(_) => LedgerErrorKind::Transport,
        }
    }

    /// Map a JSON-RPC error object onto the error taxonomy
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            CODE_FEE_TOO_LOW | CODE_REPLACEMENT_UNDERPRICED => LedgerError::FeeTooLow(message),
            CODE_SEQUENCE_TOO_LOW | CODE_SEQUENCE_EXPIRED => LedgerError::SequenceStale(message),
            // generic server errors only carry the reason in the message
            CODE_SERVER_ERROR => {
                let reason = message.to_ascii_lowercase();
                if reason.contains("underpriced") || reason.contains("fee too low") {
                    LedgerError::FeeTooLow(message)
                } else if reason.contains("nonce too low")
                    || reason.contains("nonce expired")
                    || reason.contains("sequence too low")
                {
                    LedgerError::SequenceStale(message)
                } else {
                    LedgerError::Rejected { code, message }
                }
            }
            _ => LedgerError::Rejected { code, message },
        }
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        LedgerError::Transport(e.to_string())
    }
}

/// Remote ledger operations used by the dispatcher, the orchestrator and the auditor
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current baseline fee rate, in native base units
    async fn fee_estimate(&self) -> Result<u128, LedgerError>;

    /// Next sequence number the ledger expects from `address`
    async fn sequence(&self, address: &Pubkey, tag: BlockTag) -> Result<u64, LedgerError>;

    /// Submit one signed transfer
    async fn submit(&self, transfer: &SignedTransfer) -> Result<TxHandle, LedgerError>;

    /// Finalized receipt for `handle`, or `None` while it is not (yet) known
    async fn receipt(&self, handle: &TxHandle) -> Result<Option<Receipt>, LedgerError>;

    /// Balance of `address` in base units of `asset`
    async fn balance(&self, address: &Pubkey, asset: &AssetKind) -> Result<u128, LedgerError>;
}

/// u128 quantities travel as decimal strings; numbers are accepted on read
pub mod quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(D::Error::custom),
            Raw::Number(n) => Ok(u128::from(n)),
        }
    }
}

#[derive(Deserialize)]
struct Quantity(#[serde(with = "quantity")] u128);

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// JSON-RPC over HTTP implementation of [`LedgerClient`]
pub struct RpcLedgerClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.http.post(&self.endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(LedgerError::from_rpc(error.code, error.message));
        }

        serde_json::from_value(body.result)
            .map_err(|e| LedgerError::Transport(format!("Malformed {} result: {}", method, e)))
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn fee_estimate(&self) -> Result<u128, LedgerError> {
        let fee: Quantity = self.call("ledger_feeEstimate", json!([])).await?;
        Ok(fee.0)
    }

    async fn sequence(&self, address: &Pubkey, tag: BlockTag) -> Result<u64, LedgerError> {
        let sequence: Quantity = self
            .call("ledger_getSequence", json!([address.to_string(), tag]))
            .await?;
        u64::try_from(sequence.0)
            .map_err(|_| LedgerError::Transport(format!("Sequence {} out of range", sequence.0)))
    }

    async fn submit(&self, transfer: &SignedTransfer) -> Result<TxHandle, LedgerError> {
        self.call("ledger_submit", json!([transfer])).await
    }

    async fn receipt(&self, handle: &TxHandle) -> Result<Option<Receipt>, LedgerError> {
        self.call("ledger_getReceipt", json!([handle])).await
    }

    async fn balance(&self, address: &Pubkey, asset: &AssetKind) -> Result<u128, LedgerError> {
        let balance: Quantity = self
            .call("ledger_getBalance", json!([address.to_string(), asset]))
            .await?;
        Ok(balance.0)
    }
}
