use crate::app::state::PipelineStep;
use crate::wallet::account::short_address;
use crate::wallet::keypair::Pubkey;
use crate::wallet::rpc::TxHandle;
use crate::wallet::transaction::FeeBid;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub enum WalletEvent {
    // Dispatch events
    Submitting {
        signer: Pubkey,
        attempt: u32,
        max_attempts: u32,
        fee: FeeBid,
        sequence: u64,
    },
    Submitted {
        signer: Pubkey,
        handle: TxHandle,
        attempt: u32,
    },
    FeeEscalated {
        signer: Pubkey,
        attempt: u32,
        from: FeeBid,
        to: FeeBid,
    },
    FeeBudgetReached {
        signer: Pubkey,
        attempt: u32,
        fee: FeeBid,
        budget: u128,
    },
    SequenceRefreshed {
        signer: Pubkey,
        stale: u64,
        fresh: u64,
        reason: String,
    },
    SubmissionRejected {
        signer: Pubkey,
        attempt: u32,
        error: String,
    },
    ReadFailed {
        what: &'static str,
        attempt: u32,
        error: String,
    },

    // Confirmation events
    ReceiptPending {
        handle: TxHandle,
        poll: u32,
        max_polls: u32,
    },
    ReceiptPollFailed {
        handle: TxHandle,
        poll: u32,
        error: String,
    },
    TransactionConfirmed {
        handle: TxHandle,
        block: Option<u64>,
        polls: u32,
    },

    // Pipeline events
    Staggered {
        account: Pubkey,
        index: usize,
        delay: Duration,
    },
    PipelineStarted {
        account: Pubkey,
        index: usize,
    },
    StepStarted {
        account: Pubkey,
        step: PipelineStep,
    },
    StepConfirmed {
        account: Pubkey,
        step: PipelineStep,
        handle: TxHandle,
    },
    Settling {
        account: Pubkey,
        delay: Duration,
    },
    PipelineCompleted {
        account: Pubkey,
    },
    PipelineFailed {
        account: Pubkey,
        step: PipelineStep,
        error: String,
    },
}

/// Receives every event raised by the dispatcher and the orchestrator
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WalletEvent);
}

/// Turns events into structured `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: WalletEvent) {
        match event {
            WalletEvent::Submitting {
                signer,
                attempt,
                max_attempts,
                fee,
                sequence,
            } => debug!(
                signer = %short_address(&signer),
                attempt,
                max_attempts,
                fee = %fee,
                sequence,
                "Submitting transfer"
            ),
            WalletEvent::Submitted {
                signer,
                handle,
                attempt,
            } => info!(signer = %short_address(&signer), handle = %handle, attempt, "Transfer submitted"),
            WalletEvent::FeeEscalated {
                signer,
                attempt,
                from,
                to,
            } => warn!(
                signer = %short_address(&signer),
                attempt,
                from = %from,
                to = %to,
                "Fee too low, escalating"
            ),
            WalletEvent::FeeBudgetReached {
                signer,
                attempt,
                fee,
                budget,
            } => warn!(
                signer = %short_address(&signer),
                attempt,
                fee = %fee,
                budget,
                "Fee budget reached, giving up"
            ),
            WalletEvent::SequenceRefreshed {
                signer,
                stale,
                fresh,
                reason,
            } => warn!(
                signer = %short_address(&signer),
                stale,
                fresh,
                reason = %reason,
                "Sequence stale, refreshed"
            ),
            WalletEvent::SubmissionRejected {
                signer,
                attempt,
                error,
            } => warn!(signer = %short_address(&signer), attempt, error = %error, "Submission rejected"),
            WalletEvent::ReadFailed {
                what,
                attempt,
                error,
            } => warn!(what, attempt, error = %error, "Ledger read failed, retrying"),
            WalletEvent::ReceiptPending {
                handle,
                poll,
                max_polls,
            } => debug!(handle = %handle, poll, max_polls, "Receipt not available yet"),
            WalletEvent::ReceiptPollFailed {
                handle,
                poll,
                error,
            } => warn!(handle = %handle, poll, error = %error, "Receipt lookup failed"),
            WalletEvent::TransactionConfirmed {
                handle,
                block,
                polls,
            } => info!(handle = %handle, ?block, polls, "Transaction confirmed"),
            WalletEvent::Staggered {
                account,
                index,
                delay,
            } => debug!(account = %short_address(&account), index, ?delay, "Staggering pipeline start"),
            WalletEvent::PipelineStarted { account, index } => {
                info!(account = %short_address(&account), index, "Pipeline started")
            }
            WalletEvent::StepStarted { account, step } => {
                info!(account = %short_address(&account), step = %step, "Step started")
            }
            WalletEvent::StepConfirmed {
                account,
                step,
                handle,
            } => info!(account = %short_address(&account), step = %step, handle = %handle, "Step confirmed"),
            WalletEvent::Settling { account, delay } => {
                info!(account = %short_address(&account), ?delay, "Waiting before forwarding")
            }
            WalletEvent::PipelineCompleted { account } => {
                info!(account = %short_address(&account), "Pipeline completed")
            }
            WalletEvent::PipelineFailed {
                account,
                step,
                error,
            } => warn!(account = %short_address(&account), step = %step, error = %error, "Pipeline failed"),
        }
    }
}

/// Keeps events in memory, in emission order
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<WalletEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<WalletEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: WalletEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
