//! Scriptable in-memory ledger for dispatcher and orchestrator tests

use crate::wallet::keypair::Pubkey;
use crate::wallet::rpc::{
    AssetKind, BlockTag, LedgerClient, LedgerError, Receipt, ReceiptStatus, TxHandle,
    CODE_INSUFFICIENT_FUNDS,
};
use crate::wallet::transaction::SignedTransfer;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Mutex;
use tokio::time::Instant;

const CODE_INVALID_PARAMS: i64 = -32602;

#[derive(Default)]
struct LedgerState {
    sequences: HashMap<Pubkey, u64>,
    balances: HashMap<(Pubkey, AssetKind), u128>,
    scripted_failures: HashMap<Pubkey, VecDeque<LedgerError>>,
    sequence_bumps: HashMap<Pubkey, VecDeque<u64>>,
    blocked_recipients: HashSet<Pubkey>,
    submissions: Vec<(Instant, SignedTransfer)>,
    accepted: Vec<SignedTransfer>,
    polls: HashMap<TxHandle, u32>,
    receipt_delay: u32,
    failing_polls: u32,
    failing_fee_reads: u32,
    revert_all: bool,
    block: u64,
}

/// Ledger that enforces sequences, minimum fee and balances like a real one,
/// with hooks to inject the failures a busy ledger produces
pub struct MockLedger {
    min_fee: u128,
    state: Mutex<LedgerState>,
}

impl MockLedger {
    /// `base_fee` is both the fee estimate and the lowest fee accepted
    pub fn new(base_fee: u128) -> Self {
        Self {
            min_fee: base_fee,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn set_sequence(&self, address: &Pubkey, sequence: u64) {
        self.state.lock().unwrap().sequences.insert(*address, sequence);
    }

    pub fn set_balance(&self, address: &Pubkey, asset: &AssetKind, amount: u128) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert((*address, asset.clone()), amount);
    }

    pub fn balance_of(&self, address: &Pubkey, asset: &AssetKind) -> u128 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(&(*address, asset.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn sequence_of(&self, address: &Pubkey) -> u64 {
        self.state
            .lock()
            .unwrap()
            .sequences
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Fail the next submission signed by `address` with `error`, before any other check
    pub fn fail_next_submit(&self, address: &Pubkey, error: LedgerError) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .entry(*address)
            .or_default()
            .push_back(error);
    }

    /// Another client consumes `by` sequence numbers of `address` right before its next submission
    pub fn advance_sequence_on_next_submit(&self, address: &Pubkey, by: u64) {
        self.state
            .lock()
            .unwrap()
            .sequence_bumps
            .entry(*address)
            .or_default()
            .push_back(by);
    }

    /// Reject every transfer paying `address`
    pub fn reject_transfers_to(&self, address: &Pubkey) {
        self.state.lock().unwrap().blocked_recipients.insert(*address);
    }

    /// Receipts stay unknown for the first `polls` lookups of each handle
    pub fn set_receipt_delay(&self, polls: u32) {
        self.state.lock().unwrap().receipt_delay = polls;
    }

    /// The next `n` receipt lookups fail with a transport error
    pub fn fail_receipt_polls(&self, n: u32) {
        self.state.lock().unwrap().failing_polls = n;
    }

    /// The next `n` fee estimates fail with a transport error
    pub fn fail_fee_reads(&self, n: u32) {
        self.state.lock().unwrap().failing_fee_reads = n;
    }

    /// Finalize every accepted submission as failed
    pub fn revert_all(&self) {
        self.state.lock().unwrap().revert_all = true;
    }

    /// Every submission seen, rejected ones included
    pub fn submissions(&self) -> Vec<SignedTransfer> {
        self.timeline().into_iter().map(|(_, transfer)| transfer).collect()
    }

    /// Every submission seen, with the (tokio) time it arrived
    pub fn timeline(&self) -> Vec<(Instant, SignedTransfer)> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Submissions the ledger accepted, in acceptance order
    pub fn accepted(&self) -> Vec<SignedTransfer> {
        self.state.lock().unwrap().accepted.clone()
    }

    fn apply(&self, state: &mut LedgerState, transfer: &SignedTransfer) -> Result<(), LedgerError> {
        let body = &transfer.transfer;
        let from = Pubkey::from_str(&body.from).map_err(|e| LedgerError::Rejected {
            code: CODE_INVALID_PARAMS,
            message: e.to_string(),
        })?;
        let to = Pubkey::from_str(&body.to).map_err(|e| LedgerError::Rejected {
            code: CODE_INVALID_PARAMS,
            message: e.to_string(),
        })?;

        if let Some(bump) = state.sequence_bumps.get_mut(&from).and_then(|queue| queue.pop_front()) {
            *state.sequences.entry(from).or_insert(0) += bump;
        }
        if let Some(error) = state.scripted_failures.get_mut(&from).and_then(|queue| queue.pop_front()) {
            return Err(error);
        }

        transfer.verify().map_err(|e| LedgerError::Rejected {
            code: CODE_INVALID_PARAMS,
            message: e.to_string(),
        })?;

        let expected = state.sequences.get(&from).copied().unwrap_or(0);
        if body.sequence < expected {
            return Err(LedgerError::SequenceStale(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                expected, body.sequence
            )));
        }
        if body.fee < self.min_fee {
            return Err(LedgerError::FeeTooLow("transaction underpriced".to_string()));
        }
        if state.blocked_recipients.contains(&to) {
            return Err(LedgerError::Rejected {
                code: -32000,
                message: "execution reverted: recipient blocked".to_string(),
            });
        }

        let source = state.balances.entry((from, body.asset.clone())).or_insert(0);
        if *source < body.amount {
            return Err(LedgerError::Rejected {
                code: CODE_INSUFFICIENT_FUNDS,
                message: "insufficient funds for transfer".to_string(),
            });
        }
        *source -= body.amount;
        *state.balances.entry((to, body.asset.clone())).or_insert(0) += body.amount;
        state.sequences.insert(from, body.sequence + 1);
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn fee_estimate(&self) -> Result<u128, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_fee_reads > 0 {
            state.failing_fee_reads -= 1;
            return Err(LedgerError::Transport("connection reset".to_string()));
        }
        Ok(self.min_fee)
    }

    async fn sequence(&self, address: &Pubkey, _tag: BlockTag) -> Result<u64, LedgerError> {
        Ok(self.sequence_of(address))
    }

    async fn submit(&self, transfer: &SignedTransfer) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push((Instant::now(), transfer.clone()));
        self.apply(&mut state, transfer)?;
        state.accepted.push(transfer.clone());
        Ok(TxHandle(format!("tx-{}", state.accepted.len())))
    }

    async fn receipt(&self, handle: &TxHandle) -> Result<Option<Receipt>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(LedgerError::Transport("request timed out".to_string()));
        }

        let delay = state.receipt_delay;
        let polls = state.polls.entry(handle.clone()).or_insert(0);
        *polls += 1;
        if *polls <= delay {
            return Ok(None);
        }

        state.block += 1;
        let status = if state.revert_all {
            ReceiptStatus::Failed
        } else {
            ReceiptStatus::Success
        };
        Ok(Some(Receipt {
            handle: handle.clone(),
            status,
            block: Some(state.block),
        }))
    }

    async fn balance(&self, address: &Pubkey, asset: &AssetKind) -> Result<u128, LedgerError> {
        Ok(self.balance_of(address, asset))
    }
}
