use crate::wallet::keypair::Pubkey;
use crate::wallet::transaction::TransactionRecord;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// One of the three transfers of a pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    /// Funding account sends the token amount to the generated account
    Seed,
    /// Funding account sends the fee reserve to the generated account
    Gas,
    /// Generated account forwards the token amount to the destination
    Forward,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStep::Seed => "seed",
            PipelineStep::Gas => "gas",
            PipelineStep::Forward => "forward",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    SeedPending,
    SeedConfirmed,
    GasPending,
    GasConfirmed,
    Settling,
    ForwardPending,
    ForwardConfirmed,
    Failed { step: PipelineStep, error: String },
}

impl PipelineState {
    pub fn pending(step: PipelineStep) -> Self {
        match step {
            PipelineStep::Seed => PipelineState::SeedPending,
            PipelineStep::Gas => PipelineState::GasPending,
            PipelineStep::Forward => PipelineState::ForwardPending,
        }
    }

    pub fn confirmed(step: PipelineStep) -> Self {
        match step {
            PipelineStep::Seed => PipelineState::SeedConfirmed,
            PipelineStep::Gas => PipelineState::GasConfirmed,
            PipelineStep::Forward => PipelineState::ForwardConfirmed,
        }
    }

    /// Step that is running, or would run next, in this state
    pub fn current_step(&self) -> PipelineStep {
        match self {
            PipelineState::Start | PipelineState::SeedPending => PipelineStep::Seed,
            PipelineState::SeedConfirmed | PipelineState::GasPending => PipelineStep::Gas,
            PipelineState::GasConfirmed
            | PipelineState::Settling
            | PipelineState::ForwardPending
            | PipelineState::ForwardConfirmed => PipelineStep::Forward,
            PipelineState::Failed { step, .. } => *step,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::ForwardConfirmed | PipelineState::Failed { .. }
        )
    }

    /// Forward-only transitions; failure is only reachable from a pending step
    pub fn can_transition_to(&self, next: &PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Start, SeedPending)
            | (SeedPending, SeedConfirmed)
            | (SeedConfirmed, GasPending)
            | (GasPending, GasConfirmed)
            | (GasConfirmed, Settling)
            | (Settling, ForwardPending)
            | (ForwardPending, ForwardConfirmed) => true,
            (SeedPending, Failed { step, .. }) => *step == PipelineStep::Seed,
            (GasPending, Failed { step, .. }) => *step == PipelineStep::Gas,
            (ForwardPending, Failed { step, .. }) => *step == PipelineStep::Forward,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Start => write!(f, "start"),
            PipelineState::SeedPending => write!(f, "seed pending"),
            PipelineState::SeedConfirmed => write!(f, "seed confirmed"),
            PipelineState::GasPending => write!(f, "gas pending"),
            PipelineState::GasConfirmed => write!(f, "gas confirmed"),
            PipelineState::Settling => write!(f, "settling"),
            PipelineState::ForwardPending => write!(f, "forward pending"),
            PipelineState::ForwardConfirmed => write!(f, "forward confirmed"),
            PipelineState::Failed { step, error } => write!(f, "failed at {}: {}", step, error),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid pipeline transition from {from} to {to}")]
pub struct TransitionError {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// A confirmed step of a pipeline
#[derive(Clone, Debug)]
pub struct StepRecord {
    pub step: PipelineStep,
    pub record: TransactionRecord,
}

/// Everything known about a pipeline so far
#[derive(Clone, Debug)]
pub struct PipelineProgress {
    pub state: PipelineState,
    pub records: Vec<StepRecord>,
}

impl Default for PipelineProgress {
    fn default() -> Self {
        Self {
            state: PipelineState::Start,
            records: Vec::new(),
        }
    }
}

/// Owns the progress of one pipeline and publishes every transition and
/// confirmed step.
///
/// The receiver side lets the orchestrator see how far a task got even if
/// the task itself never returns.
pub struct PipelineTracker {
    progress: watch::Sender<PipelineProgress>,
}

impl PipelineTracker {
    pub fn new() -> (Self, watch::Receiver<PipelineProgress>) {
        let (progress, receiver) = watch::channel(PipelineProgress::default());
        (Self { progress }, receiver)
    }

    pub fn state(&self) -> PipelineState {
        self.progress.borrow().state.clone()
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.progress.borrow().records.clone()
    }

    pub fn advance(&self, next: PipelineState) -> Result<(), TransitionError> {
        let current = self.state();
        if !current.can_transition_to(&next) {
            return Err(TransitionError {
                from: current,
                to: next,
            });
        }
        self.progress.send_modify(|progress| progress.state = next);
        Ok(())
    }

    pub fn fail(&self, step: PipelineStep, error: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(PipelineState::Failed {
            step,
            error: error.into(),
        })
    }

    /// Publish a confirmed transfer before the state moves past its step
    pub fn record(&self, record: StepRecord) {
        self.progress.send_modify(|progress| progress.records.push(record));
    }
}

/// Terminal report of one pipeline
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub index: usize,
    pub account: Pubkey,
    pub state: PipelineState,
    pub records: Vec<StepRecord>,
}

impl PipelineReport {
    /// Report for a task that died without producing its own report.
    /// Transfers it confirmed before dying are kept.
    pub fn crashed(index: usize, account: Pubkey, last: &PipelineProgress, reason: &str) -> Self {
        Self {
            index,
            account,
            state: PipelineState::Failed {
                step: last.state.current_step(),
                error: format!("pipeline task aborted: {}", reason),
            },
            records: last.records.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == PipelineState::ForwardConfirmed
    }

    pub fn record(&self, step: PipelineStep) -> Option<&TransactionRecord> {
        self.records
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.record)
    }
}

/// Aggregate outcome of one orchestrator run
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub reports: Vec<PipelineReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    pub fn confirmed_dispatches(&self) -> usize {
        self.reports.iter().map(|r| r.records.len()).sum()
    }

    /// Base units moved by every confirmed `step` transfer
    pub fn total_for(&self, step: PipelineStep) -> u128 {
        self.reports
            .iter()
            .filter_map(|r| r.record(step))
            .map(|record| record.amount)
            .sum()
    }

    pub fn token_distributed(&self) -> u128 {
        self.total_for(PipelineStep::Seed)
    }

    pub fn native_distributed(&self) -> u128 {
        self.total_for(PipelineStep::Gas)
    }

    pub fn token_forwarded(&self) -> u128 {
        self.total_for(PipelineStep::Forward)
    }
}
