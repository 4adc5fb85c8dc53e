pub mod audit;
pub mod events;
pub mod state;

pub use audit::{AuditReport, BalanceAuditor};
pub use events::{EventSink, MemorySink, TracingSink, WalletEvent};
pub use state::{PipelineReport, PipelineState, PipelineStep, PipelineTracker, RunSummary};

use crate::config::ConcurrencyMode;
use crate::wallet::account::Account;
use crate::wallet::keypair::{Pubkey, WalletKeypair};
use crate::wallet::rpc::{AssetKind, LedgerClient, LedgerError};
use crate::wallet::transaction::{
    DispatchError, SubmissionOutcome, TransactionDispatcher, TransactionRecord, TransferIntent,
};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use state::{PipelineProgress, StepRecord, TransitionError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinError;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// What every pipeline moves, and how pipelines are scheduled
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub destination: Pubkey,
    pub token: AssetKind,
    /// Token base units seeded into each account and forwarded on
    pub token_amount: u128,
    /// Native base units sent to each account to pay for its forward
    pub fee_reserve: u128,
    pub mode: ConcurrencyMode,
    /// Parallel mode only: task `i` waits `i * stagger` before its first submission
    pub stagger: Duration,
    pub settle_delay: Duration,
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("gave up after {attempts} attempts, last error: {last_error}")]
    Exhausted { attempts: u32, last_error: LedgerError },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug)]
struct StepFailure {
    step: PipelineStep,
    error: StepError,
}

impl StepFailure {
    fn new(step: PipelineStep, error: impl Into<StepError>) -> Self {
        Self {
            step,
            error: error.into(),
        }
    }
}

/// Runs the seed, gas and forward pipeline once per generated account
#[derive(Clone)]
pub struct WorkerOrchestrator {
    ledger: Arc<dyn LedgerClient>,
    dispatcher: Arc<TransactionDispatcher>,
    funding: Arc<Account>,
    plan: Arc<TransferPlan>,
    events: Arc<dyn EventSink>,
}

impl WorkerOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        dispatcher: TransactionDispatcher,
        funding: Account,
        plan: TransferPlan,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ledger,
            dispatcher: Arc::new(dispatcher),
            funding: Arc::new(funding),
            plan: Arc::new(plan),
            events,
        }
    }

    pub fn funding_address(&self) -> Pubkey {
        self.funding.address
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Fail early when the funding account cannot cover `count` pipelines
    pub async fn preflight(&self, count: usize) -> Result<()> {
        let count = count as u128;
        let funding = self.funding.address;

        let (token, native) = tokio::join!(
            self.ledger.balance(&funding, &self.plan.token),
            self.ledger.balance(&funding, &AssetKind::Native),
        );
        let token = token.context("Failed to read funding token balance")?;
        let native = native.context("Failed to read funding native balance")?;

        let token_needed = self
            .plan
            .token_amount
            .checked_mul(count)
            .context("Token amount overflows")?;
        let native_needed = self
            .plan
            .fee_reserve
            .checked_mul(count)
            .context("Fee reserve overflows")?;

        info!(
            account = %funding,
            token,
            native,
            token_needed,
            native_needed,
            "Funding account balances"
        );

        if token < token_needed {
            bail!(
                "Insufficient token balance: have {}, need {} base units",
                token,
                token_needed
            );
        }
        if native < native_needed {
            bail!(
                "Insufficient native balance: have {}, need {} base units",
                native,
                native_needed
            );
        }
        Ok(())
    }

    /// Run one pipeline per account and collect every terminal report
    pub async fn run(&self, accounts: Vec<Account>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let span = info_span!("run", %run_id, mode = ?self.plan.mode);

        let mut reports = async {
            info!(accounts = accounts.len(), "Starting transfers");
            match self.plan.mode {
                ConcurrencyMode::Sequential => self.run_sequential(accounts).await,
                ConcurrencyMode::Parallel => self.run_parallel(accounts).await,
            }
        }
        .instrument(span)
        .await;
        reports.sort_by_key(|report| report.index);

        RunSummary {
            run_id,
            reports,
            elapsed: started.elapsed(),
        }
    }

    /// One task at a time, each awaited before the next account starts
    async fn run_sequential(&self, accounts: Vec<Account>) -> Vec<PipelineReport> {
        let mut reports = Vec::with_capacity(accounts.len());
        for (index, account) in accounts.into_iter().enumerate() {
            let (tracker, watcher) = PipelineTracker::new();
            let address = account.address;
            let orchestrator = self.clone();

            let joined = tokio::spawn(
                async move { orchestrator.run_pipeline(index, &account, &tracker).await }
                    .in_current_span(),
            )
            .await;
            reports.push(self.settle_task(index, address, &watcher, joined));
        }
        reports
    }

    async fn run_parallel(&self, accounts: Vec<Account>) -> Vec<PipelineReport> {
        let limit = self.plan.max_in_flight.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut handles = Vec::with_capacity(accounts.len());
        let mut watchers = Vec::with_capacity(accounts.len());

        for (index, account) in accounts.into_iter().enumerate() {
            let (tracker, watcher) = PipelineTracker::new();
            watchers.push((index, account.address, watcher));

            let orchestrator = self.clone();
            let limit = limit.clone();
            let delay = self
                .plan
                .stagger
                .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));

            handles.push(tokio::spawn(
                async move {
                    if !delay.is_zero() {
                        orchestrator.events.emit(WalletEvent::Staggered {
                            account: account.address,
                            index,
                            delay,
                        });
                        tokio::time::sleep(delay).await;
                    }
                    let _permit = match limit {
                        Some(limit) => limit.acquire_owned().await.ok(),
                        None => None,
                    };
                    orchestrator.run_pipeline(index, &account, &tracker).await
                }
                .in_current_span(),
            ));
        }

        join_all(handles)
            .await
            .into_iter()
            .zip(watchers)
            .map(|(joined, (index, address, watcher))| self.settle_task(index, address, &watcher, joined))
            .collect()
    }

    /// Turn a finished task into its report. A task that panicked or was
    /// cancelled is reported as failed at the step it had reached, keeping
    /// the transfers it confirmed.
    fn settle_task(
        &self,
        index: usize,
        address: Pubkey,
        watcher: &watch::Receiver<PipelineProgress>,
        joined: Result<PipelineReport, JoinError>,
    ) -> PipelineReport {
        match joined {
            Ok(report) => report,
            Err(e) => {
                let last = watcher.borrow().clone();
                error!(index, account = %address, state = %last.state, "Pipeline task aborted: {}", e);
                let report = PipelineReport::crashed(index, address, &last, &e.to_string());
                if let PipelineState::Failed { step, error } = &report.state {
                    self.events.emit(WalletEvent::PipelineFailed {
                        account: address,
                        step: *step,
                        error: error.clone(),
                    });
                }
                report
            }
        }
    }

    /// Seed, gas, settle, forward for one account. Never panics on ledger errors:
    /// every failure ends up in the report.
    pub async fn run_pipeline(
        &self,
        index: usize,
        account: &Account,
        tracker: &PipelineTracker,
    ) -> PipelineReport {
        let span = info_span!("pipeline", index, account = %account.short_address());

        async {
            self.events.emit(WalletEvent::PipelineStarted {
                account: account.address,
                index,
            });

            let state = match self.drive(account, tracker).await {
                Ok(()) => {
                    self.events.emit(WalletEvent::PipelineCompleted {
                        account: account.address,
                    });
                    tracker.state()
                }
                Err(failure) => {
                    let error = failure.error.to_string();
                    if let Err(e) = tracker.fail(failure.step, error.clone()) {
                        error!("Could not record pipeline failure: {}", e);
                    }
                    self.events.emit(WalletEvent::PipelineFailed {
                        account: account.address,
                        step: failure.step,
                        error: error.clone(),
                    });
                    PipelineState::Failed {
                        step: failure.step,
                        error,
                    }
                }
            };

            PipelineReport {
                index,
                account: account.address,
                state,
                records: tracker.records(),
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, account: &Account, tracker: &PipelineTracker) -> Result<(), StepFailure> {
        let plan = &self.plan;
        let funding = &self.funding;

        let seed = TransferIntent {
            from: funding.address,
            to: account.address,
            amount: plan.token_amount,
            asset: plan.token.clone(),
            fee_budget: None,
        };
        self.execute_step(PipelineStep::Seed, account, &seed, &funding.credential, tracker)
            .await?;

        let gas = TransferIntent {
            from: funding.address,
            to: account.address,
            amount: plan.fee_reserve,
            asset: AssetKind::Native,
            fee_budget: None,
        };
        self.execute_step(PipelineStep::Gas, account, &gas, &funding.credential, tracker)
            .await?;

        tracker
            .advance(PipelineState::Settling)
            .map_err(|e| StepFailure::new(PipelineStep::Forward, e))?;
        self.events.emit(WalletEvent::Settling {
            account: account.address,
            delay: plan.settle_delay,
        });
        tokio::time::sleep(plan.settle_delay).await;

        let forward = TransferIntent {
            from: account.address,
            to: plan.destination,
            amount: plan.token_amount,
            asset: plan.token.clone(),
            fee_budget: None,
        };
        self.execute_step(
            PipelineStep::Forward,
            account,
            &forward,
            &account.credential,
            tracker,
        )
        .await
    }

    async fn execute_step(
        &self,
        step: PipelineStep,
        account: &Account,
        intent: &TransferIntent,
        signer: &WalletKeypair,
        tracker: &PipelineTracker,
    ) -> Result<(), StepFailure> {
        tracker
            .advance(PipelineState::pending(step))
            .map_err(|e| StepFailure::new(step, e))?;
        self.events.emit(WalletEvent::StepStarted {
            account: account.address,
            step,
        });

        let outcome = self
            .dispatcher
            .dispatch(intent, signer)
            .instrument(info_span!("step", %step))
            .await
            .map_err(|e| StepFailure::new(step, e))?;

        match outcome {
            SubmissionOutcome::Confirmed(confirmation) => {
                let record = TransactionRecord::confirmed(intent, &confirmation);
                self.events.emit(WalletEvent::StepConfirmed {
                    account: account.address,
                    step,
                    handle: record.handle.clone(),
                });
                tracker.record(StepRecord { step, record });
                tracker
                    .advance(PipelineState::confirmed(step))
                    .map_err(|e| StepFailure::new(step, e))
            }
            SubmissionOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(StepFailure::new(
                step,
                StepError::Exhausted {
                    attempts,
                    last_error,
                },
            )),
        }
    }
}
