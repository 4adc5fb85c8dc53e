pub mod account;
pub mod keypair;
pub mod rpc;
pub mod storage;
pub mod transaction;
pub mod units;

#[cfg(test)]
pub mod mock;

pub use account::Account;
pub use keypair::{Pubkey, WalletKeypair};
pub use rpc::{AssetKind, LedgerClient, LedgerError, LedgerErrorKind, RpcLedgerClient, TxHandle};
pub use storage::{AccountRecord, AccountStore};
pub use transaction::{
    DispatchError, DispatchPolicy, FeeBid, SubmissionOutcome, TransactionDispatcher,
    TransactionRecord, TransferIntent,
};
