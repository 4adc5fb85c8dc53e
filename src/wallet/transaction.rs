use crate::app::events::{EventSink, WalletEvent};
use crate::wallet::keypair::{Pubkey, WalletKeypair};
use crate::wallet::rpc::{
    quantity, AssetKind, BlockTag, LedgerClient, LedgerError, LedgerErrorKind, Receipt,
    ReceiptStatus, TxHandle,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const BPS_DENOMINATOR: u128 = 10_000;

/// Fee rate offered for one submission, in native base units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeeBid(pub u128);

impl FeeBid {
    /// Raise the bid by `factor_bps` (11_000 = +10%), always by at least one unit
    pub fn escalate(self, factor_bps: u32) -> FeeBid {
        let scaled = self.0.saturating_mul(u128::from(factor_bps)) / BPS_DENOMINATOR;
        FeeBid(scaled.max(self.0.saturating_add(1)))
    }
}

impl fmt::Display for FeeBid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One transfer to drive to a terminal outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub from: Pubkey,
    pub to: Pubkey,
    /// Base units of `asset`
    pub amount: u128,
    pub asset: AssetKind,
    /// Highest fee bid this intent may escalate to
    pub fee_budget: Option<u128>,
}

/// Transfer body covered by the signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransfer {
    pub from: String,
    pub to: String,
    pub asset: AssetKind,
    #[serde(with = "quantity")]
    pub amount: u128,
    #[serde(with = "quantity")]
    pub fee: u128,
    pub sequence: u64,
}

impl UnsignedTransfer {
    pub fn new(intent: &TransferIntent, fee: FeeBid, sequence: u64) -> Self {
        Self {
            from: intent.from.to_string(),
            to: intent.to.to_string(),
            asset: intent.asset.clone(),
            amount: intent.amount,
            fee: fee.0,
            sequence,
        }
    }

    /// Canonical bytes the signature is computed over
    pub fn signing_message(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.from, self.to, self.asset, self.amount, self.fee, self.sequence
        )
        .into_bytes()
    }

    pub fn sign(self, signer: &WalletKeypair) -> SignedTransfer {
        let signature =
            bs58::encode(signer.sign_message(&self.signing_message()).to_bytes()).into_string();
        SignedTransfer {
            transfer: self,
            signature,
        }
    }
}

/// Transfer ready for submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransfer {
    pub transfer: UnsignedTransfer,
    /// base58 ed25519 signature of `transfer.signing_message()`
    pub signature: String,
}

impl SignedTransfer {
    /// Check the signature against the `from` address
    pub fn verify(&self) -> Result<()> {
        let from = Pubkey::from_str(&self.transfer.from)?;
        let key = VerifyingKey::from_bytes(&from.to_bytes())
            .map_err(|e| anyhow!("Invalid from key: {}", e))?;

        let signature: [u8; 64] = bs58::decode(&self.signature)
            .into_vec()
            .map_err(|e| anyhow!("Invalid signature encoding: {}", e))?
            .try_into()
            .map_err(|_| anyhow!("Signature must be 64 bytes"))?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature);

        key.verify(&self.transfer.signing_message(), &signature)
            .map_err(|_| anyhow!("Signature does not match transfer"))
    }
}

/// Retry and polling limits of the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// Multiplicative fee escalation in basis points (11_000 = x1.10)
    pub fee_escalation_bps: u32,
    /// Default ceiling for intents without their own budget
    pub fee_budget: Option<u128>,
    /// Tries for each fee/sequence read before the dispatch fails
    pub read_attempts: u32,
    pub read_retry_delay: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 300,
            fee_escalation_bps: 11_000, // +10%
            fee_budget: None,
            read_attempts: 3,
            read_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Fatal outcome of one dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("submission rejected: {0}")]
    Rejected(#[source] LedgerError),

    #[error("failed to read {what} from ledger: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: LedgerError,
    },

    #[error("transaction {handle} not found after {polls} polls, possibly dropped")]
    ConfirmationTimeout { handle: TxHandle, polls: u32 },

    #[error("transaction {handle} was finalized but failed")]
    Reverted { handle: TxHandle, receipt: Receipt },

    #[error("{signer} cannot sign for {from}")]
    SignerMismatch { signer: Pubkey, from: Pubkey },

    #[error("max attempts must be at least 1")]
    NoAttempts,
}

/// A finalized submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub receipt: Receipt,
    pub fee: FeeBid,
    pub sequence: u64,
    pub attempts: u32,
}

/// Terminal, non-fatal result of a dispatch
#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    Confirmed(Confirmation),
    /// Every attempt failed with a recoverable error
    Exhausted { attempts: u32, last_error: LedgerError },
}

/// Confirmed transfer as reported to the user
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub handle: TxHandle,
    pub from: Pubkey,
    pub to: Pubkey,
    pub asset: AssetKind,
    pub amount: u128,
    pub fee: FeeBid,
    pub sequence: u64,
    pub attempts: u32,
    pub block: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn confirmed(intent: &TransferIntent, confirmation: &Confirmation) -> Self {
        Self {
            handle: confirmation.receipt.handle.clone(),
            from: intent.from,
            to: intent.to,
            asset: intent.asset.clone(),
            amount: intent.amount,
            fee: confirmation.fee,
            sequence: confirmation.sequence,
            attempts: confirmation.attempts,
            block: confirmation.receipt.block,
            timestamp: Utc::now(),
        }
    }
}

/// Drives transfer intents through submission, retry and confirmation
pub struct TransactionDispatcher {
    ledger: Arc<dyn LedgerClient>,
    policy: DispatchPolicy,
    events: Arc<dyn EventSink>,
}

impl TransactionDispatcher {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        policy: DispatchPolicy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ledger,
            policy,
            events,
        }
    }

    /// Sign and submit `intent` with `signer`, retrying per policy
    pub async fn dispatch(
        &self,
        intent: &TransferIntent,
        signer: &WalletKeypair,
    ) -> Result<SubmissionOutcome, DispatchError> {
        if signer.pubkey() != intent.from {
            return Err(DispatchError::SignerMismatch {
                signer: signer.pubkey(),
                from: intent.from,
            });
        }

        let ledger = self.ledger.clone();
        let budget = intent.fee_budget.or(self.policy.fee_budget);
        let build_and_send = |fee: FeeBid, sequence: u64| {
            let transfer = UnsignedTransfer::new(intent, fee, sequence).sign(signer);
            let ledger = ledger.clone();
            async move { ledger.submit(&transfer).await }
        };

        self.run_attempts(build_and_send, self.policy.max_attempts, &intent.from, budget)
            .await
    }

    /// Retry loop around `build_and_send(fee, sequence)`, which must perform
    /// exactly one ledger submission.
    ///
    /// Fee-too-low escalates the fee and keeps the sequence; sequence-stale
    /// re-reads the sequence and keeps the fee; anything else is fatal.
    pub async fn submit_with_retries<F, Fut>(
        &self,
        build_and_send: F,
        max_attempts: u32,
        signing_account: &Pubkey,
    ) -> Result<SubmissionOutcome, DispatchError>
    where
        F: FnMut(FeeBid, u64) -> Fut,
        Fut: Future<Output = Result<TxHandle, LedgerError>>,
    {
        self.run_attempts(build_and_send, max_attempts, signing_account, self.policy.fee_budget)
            .await
    }

    async fn run_attempts<F, Fut>(
        &self,
        mut build_and_send: F,
        max_attempts: u32,
        signer: &Pubkey,
        budget: Option<u128>,
    ) -> Result<SubmissionOutcome, DispatchError>
    where
        F: FnMut(FeeBid, u64) -> Fut,
        Fut: Future<Output = Result<TxHandle, LedgerError>>,
    {
        if max_attempts == 0 {
            return Err(DispatchError::NoAttempts);
        }

        let mut fee = FeeBid(self.read_fee_estimate().await?);
        if let Some(budget) = budget {
            if fee.0 > budget {
                warn!(signer = %signer, estimate = %fee, budget, "Fee estimate above budget, bidding the budget");
                fee = FeeBid(budget);
            }
        }
        let mut sequence = self.read_sequence(signer).await?;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            self.events.emit(WalletEvent::Submitting {
                signer: *signer,
                attempt,
                max_attempts,
                fee,
                sequence,
            });

            let err = match build_and_send(fee, sequence).await {
                Ok(handle) => {
                    self.events.emit(WalletEvent::Submitted {
                        signer: *signer,
                        handle: handle.clone(),
                        attempt,
                    });
                    let receipt = self.poll_for_receipt(&handle).await?;
                    return Ok(SubmissionOutcome::Confirmed(Confirmation {
                        receipt,
                        fee,
                        sequence,
                        attempts: attempt,
                    }));
                }
                Err(err) => err,
            };

            match err.kind() {
                LedgerErrorKind::FeeTooLow => {
                    if attempt < max_attempts {
                        let next = fee.escalate(self.policy.fee_escalation_bps);
                        if let Some(budget) = budget.filter(|budget| next.0 > *budget) {
                            self.events.emit(WalletEvent::FeeBudgetReached {
                                signer: *signer,
                                attempt,
                                fee,
                                budget,
                            });
                            return Ok(SubmissionOutcome::Exhausted {
                                attempts: attempt,
                                last_error: err,
                            });
                        }
                        self.events.emit(WalletEvent::FeeEscalated {
                            signer: *signer,
                            attempt,
                            from: fee,
                            to: next,
                        });
                        fee = next;
                    }
                }
                LedgerErrorKind::SequenceStale => {
                    if attempt < max_attempts {
                        let fresh = self.read_sequence(signer).await?;
                        self.events.emit(WalletEvent::SequenceRefreshed {
                            signer: *signer,
                            stale: sequence,
                            fresh,
                            reason: err.to_string(),
                        });
                        sequence = fresh;
                    }
                }
                LedgerErrorKind::Rejected | LedgerErrorKind::Transport => {
                    self.events.emit(WalletEvent::SubmissionRejected {
                        signer: *signer,
                        attempt,
                        error: err.to_string(),
                    });
                    return Err(DispatchError::Rejected(err));
                }
            }
            last_error = Some(err);
        }

        let last_error = last_error.ok_or(DispatchError::NoAttempts)?;
        Ok(SubmissionOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Poll for the receipt of `handle` until it appears or the poll budget runs out.
    ///
    /// Never resubmits. A failed receipt is reported as [`DispatchError::Reverted`].
    pub async fn poll_for_receipt(&self, handle: &TxHandle) -> Result<Receipt, DispatchError> {
        let max_polls = self.policy.max_poll_attempts;

        for poll in 1..=max_polls {
            match self.ledger.receipt(handle).await {
                Ok(Some(receipt)) => {
                    if receipt.status == ReceiptStatus::Failed {
                        return Err(DispatchError::Reverted {
                            handle: handle.clone(),
                            receipt,
                        });
                    }
                    self.events.emit(WalletEvent::TransactionConfirmed {
                        handle: handle.clone(),
                        block: receipt.block,
                        polls: poll,
                    });
                    return Ok(receipt);
                }
                Ok(None) => self.events.emit(WalletEvent::ReceiptPending {
                    handle: handle.clone(),
                    poll,
                    max_polls,
                }),
                Err(e) => self.events.emit(WalletEvent::ReceiptPollFailed {
                    handle: handle.clone(),
                    poll,
                    error: e.to_string(),
                }),
            }

            if poll < max_polls {
                tokio::time::sleep(self.policy.poll_interval).await;
            }
        }

        Err(DispatchError::ConfirmationTimeout {
            handle: handle.clone(),
            polls: max_polls,
        })
    }

    async fn read_fee_estimate(&self) -> Result<u128, DispatchError> {
        let ledger = self.ledger.clone();
        self.read_with_retries("fee estimate", || {
            let ledger = ledger.clone();
            async move { ledger.fee_estimate().await }
        })
        .await
    }

    async fn read_sequence(&self, address: &Pubkey) -> Result<u64, DispatchError> {
        let ledger = self.ledger.clone();
        let sequence = self
            .read_with_retries("sequence", || {
                let ledger = ledger.clone();
                let address = *address;
                async move { ledger.sequence(&address, BlockTag::Latest).await }
            })
            .await?;
        debug!(account = %address, sequence, "Retrieved sequence");
        Ok(sequence)
    }

    async fn read_with_retries<T, F, Fut>(
        &self,
        what: &'static str,
        mut read: F,
    ) -> Result<T, DispatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let attempts = self.policy.read_attempts.max(1);
        let mut attempt = 1;
        loop {
            match read().await {
                Ok(value) => return Ok(value),
                Err(source) if attempt >= attempts => {
                    return Err(DispatchError::Read { what, source });
                }
                Err(e) => {
                    self.events.emit(WalletEvent::ReadFailed {
                        what,
                        attempt,
                        error: e.to_string(),
                    });
                    attempt += 1;
                    tokio::time::sleep(self.policy.read_retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::MemorySink;
    use crate::wallet::mock::MockLedger;

    const BASE_FEE: u128 = 1_000_000_000;

    fn policy() -> DispatchPolicy {
        DispatchPolicy {
            poll_interval: Duration::from_millis(10),
            read_retry_delay: Duration::from_millis(1),
            ..DispatchPolicy::default()
        }
    }

    fn dispatcher(ledger: Arc<MockLedger>, policy: DispatchPolicy) -> (TransactionDispatcher, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (TransactionDispatcher::new(ledger, policy, sink.clone()), sink)
    }

    fn native_intent(signer: &WalletKeypair, amount: u128) -> TransferIntent {
        TransferIntent {
            from: signer.pubkey(),
            to: Pubkey::new_unique(),
            amount,
            asset: AssetKind::Native,
            fee_budget: None,
        }
    }

    #[test]
    fn test_fee_escalation_is_ten_percent() {
        assert_eq!(FeeBid(BASE_FEE).escalate(11_000), FeeBid(1_100_000_000));
        // small bids still strictly increase
        assert_eq!(FeeBid(1).escalate(11_000), FeeBid(2));
        assert_eq!(FeeBid(0).escalate(11_000), FeeBid(1));
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let signer = WalletKeypair::new();
        let intent = native_intent(&signer, 5);
        let signed = UnsignedTransfer::new(&intent, FeeBid(10), 4).sign(&signer);
        assert!(signed.verify().is_ok());

        let mut tampered = signed.clone();
        tampered.transfer.amount = 6;
        assert!(tampered.verify().is_err());

        let other = WalletKeypair::new();
        let forged = UnsignedTransfer::new(&intent, FeeBid(10), 4).sign(&other);
        assert!(forged.verify().is_err());
    }

    #[tokio::test]
    async fn test_first_attempt_confirms() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        ledger.set_sequence(&signer.pubkey(), 7);
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();

        let SubmissionOutcome::Confirmed(confirmation) = outcome else {
            panic!("expected confirmation, got {:?}", outcome);
        };
        assert_eq!(confirmation.fee, FeeBid(BASE_FEE));
        assert_eq!(confirmation.sequence, 7);
        assert_eq!(confirmation.attempts, 1);
        assert_eq!(ledger.submissions().len(), 1);
        assert!(ledger.submissions()[0].verify().is_ok());
    }

    #[tokio::test]
    async fn test_fee_too_low_escalates_and_keeps_sequence() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        ledger.set_sequence(&signer.pubkey(), 3);
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        for _ in 0..4 {
            ledger.fail_next_submit(&signer.pubkey(), LedgerError::FeeTooLow("underpriced".into()));
        }
        let (dispatcher, sink) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();

        let SubmissionOutcome::Confirmed(confirmation) = outcome else {
            panic!("expected confirmation, got {:?}", outcome);
        };
        // 1.1^4
        assert_eq!(confirmation.fee, FeeBid(1_464_100_000));
        assert_eq!(confirmation.attempts, 5);

        let submissions = ledger.submissions();
        assert_eq!(submissions.len(), 5);
        for pair in submissions.windows(2) {
            assert!(pair[1].transfer.fee > pair[0].transfer.fee);
            assert_eq!(pair[1].transfer.sequence, pair[0].transfer.sequence);
        }
        assert!(submissions.iter().all(|s| s.transfer.sequence == 3));

        let escalations = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, WalletEvent::FeeEscalated { .. }))
            .count();
        assert_eq!(escalations, 4);
    }

    #[tokio::test]
    async fn test_sequence_stale_refreshes_and_keeps_fee() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        ledger.set_sequence(&signer.pubkey(), 1);
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        ledger.advance_sequence_on_next_submit(&signer.pubkey(), 2);
        ledger.advance_sequence_on_next_submit(&signer.pubkey(), 1);
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Confirmed(_)));
        let sequences: Vec<u64> = ledger.submissions().iter().map(|s| s.transfer.sequence).collect();
        assert_eq!(sequences, vec![1, 3, 4]);
        assert!(ledger
            .submissions()
            .iter()
            .all(|s| s.transfer.fee == BASE_FEE));
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        for _ in 0..10 {
            ledger.fail_next_submit(&signer.pubkey(), LedgerError::FeeTooLow("underpriced".into()));
        }
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();

        match outcome {
            SubmissionOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(last_error.kind(), LedgerErrorKind::FeeTooLow);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(ledger.submissions().len(), 5);
    }

    #[tokio::test]
    async fn test_mixed_recoverable_failures_exhaust() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        for i in 0..3 {
            let err = if i % 2 == 0 {
                LedgerError::SequenceStale("nonce too low".into())
            } else {
                LedgerError::FeeTooLow("underpriced".into())
            };
            ledger.fail_next_submit(&signer.pubkey(), err);
        }
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .submit_with_retries(
                |fee, sequence| {
                    let transfer = UnsignedTransfer::new(&native_intent(&signer, 1), fee, sequence).sign(&signer);
                    let ledger = ledger.clone();
                    async move { ledger.submit(&transfer).await }
                },
                3,
                &signer.pubkey(),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            SubmissionOutcome::Exhausted { attempts: 3, .. }
        ));
        assert_eq!(ledger.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        ledger.fail_next_submit(&signer.pubkey(), LedgerError::FeeTooLow("underpriced".into()));
        ledger.fail_next_submit(
            &signer.pubkey(),
            LedgerError::Rejected {
                code: -32003,
                message: "insufficient funds".into(),
            },
        );
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let err = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Rejected(_)));
        assert_eq!(ledger.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_fee_budget_ends_escalation() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let signer = WalletKeypair::new();
        for _ in 0..5 {
            ledger.fail_next_submit(&signer.pubkey(), LedgerError::FeeTooLow("underpriced".into()));
        }
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());
        let mut intent = native_intent(&signer, 10);
        intent.fee_budget = Some(1_250_000_000);

        let outcome = dispatcher.dispatch(&intent, &signer).await.unwrap();

        assert!(matches!(
            outcome,
            SubmissionOutcome::Exhausted { attempts: 3, .. }
        ));
        assert!(ledger
            .submissions()
            .iter()
            .all(|s| s.transfer.fee <= 1_250_000_000));
    }

    #[tokio::test]
    async fn test_receipt_after_several_polls() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        ledger.set_receipt_delay(4);
        let signer = WalletKeypair::new();
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        let (dispatcher, sink) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Confirmed(_)));
        assert_eq!(ledger.submissions().len(), 1);
        let pending = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, WalletEvent::ReceiptPending { .. }))
            .count();
        assert_eq!(pending, 4);
    }

    #[tokio::test]
    async fn test_poll_errors_do_not_stop_polling() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        ledger.fail_receipt_polls(2);
        let signer = WalletKeypair::new();
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Confirmed(_)));
    }

    #[tokio::test]
    async fn test_missing_receipt_times_out() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        ledger.set_receipt_delay(u32::MAX);
        let signer = WalletKeypair::new();
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        let policy = DispatchPolicy {
            max_poll_attempts: 5,
            ..policy()
        };
        let (dispatcher, _) = dispatcher(ledger.clone(), policy);

        let err = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::ConfirmationTimeout { polls: 5, .. }
        ));
        // never resubmitted
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_receipt_is_reverted() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        ledger.revert_all();
        let signer = WalletKeypair::new();
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let err = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Reverted { .. }));
    }

    #[tokio::test]
    async fn test_transient_fee_read_is_retried() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        ledger.fail_fee_reads(2);
        let signer = WalletKeypair::new();
        ledger.set_balance(&signer.pubkey(), &AssetKind::Native, 100);
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());

        let outcome = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Confirmed(_)));

        ledger.fail_fee_reads(3);
        let err = dispatcher
            .dispatch(&native_intent(&signer, 10), &signer)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Read { what: "fee estimate", .. }));
    }

    #[tokio::test]
    async fn test_signer_must_match_intent() {
        let ledger = Arc::new(MockLedger::new(BASE_FEE));
        let (dispatcher, _) = dispatcher(ledger.clone(), policy());
        let owner = WalletKeypair::new();
        let intruder = WalletKeypair::new();

        let err = dispatcher
            .dispatch(&native_intent(&owner, 10), &intruder)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::SignerMismatch { .. }));
        assert!(ledger.submissions().is_empty());
    }
}
