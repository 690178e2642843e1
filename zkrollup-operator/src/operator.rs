//! Single-writer rollup operator.
//!
//! One task owns the account database and the pending deposit stack. Commands
//! arrive over a bounded channel and are applied strictly in order; reads are
//! answered at once from a summary of the last committed state. Proving runs
//! on the blocking pool: the state moves into the proving task and comes back
//! with the result, so no job copies the account database. A job cancelled
//! while proving is answered immediately and its changes are reverted when
//! the task hands the state back. While a job is proving, further submissions
//! are accepted and wait their turn.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use zkrollup_state::{
    apply_transaction, process_deposit, revert, settle, snapshot, AccountDb, AccumulatorLayout,
    Commitment, ContextStats, Deposit, PendingDepositStack, ProofDigest, ProvingContext,
    PublicKey, RollupError, Signature, StackLayout, StateSnapshot, Transaction, TransitionProof,
};

use crate::config::OperatorConfig;

/// Operator errors.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Rollup(#[from] RollupError),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Proving task failed: {0}")]
    TaskFailed(String),

    #[error("Operator is not running")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OperatorError {
    /// Whether the request itself was invalid.
    pub fn is_validation(&self) -> bool {
        matches!(self, OperatorError::Rollup(e) if e.is_validation())
    }
}

/// Point-in-time view of the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStatus {
    pub state: StateSnapshot,
    pub accounts: AccumulatorLayout,
    pub account_count: usize,
    pub pending_deposits: StackLayout,
    /// Proofs committed but not yet settled.
    pub unsettled_proofs: usize,
    pub last_settlement: Option<ProofDigest>,
    /// A proving job is running.
    pub busy: bool,
    /// Submissions waiting behind the running job.
    pub backlog: usize,
    pub proving: ContextStats,
}

type Reply<T> = oneshot::Sender<Result<T, OperatorError>>;

/// State-changing requests, applied in arrival order.
enum Request {
    EnqueueDeposit {
        deposit: Deposit,
        reply: Reply<Commitment>,
    },
    ProcessDeposit {
        cancel: watch::Receiver<bool>,
        reply: Reply<TransitionProof>,
    },
    SubmitTransaction {
        tx: Transaction,
        signature: Signature,
        cancel: watch::Receiver<bool>,
        reply: Reply<TransitionProof>,
    },
    /// `proofs: None` settles the unsettled journal.
    Settle {
        proofs: Option<Vec<TransitionProof>>,
        cancel: watch::Receiver<bool>,
        reply: Reply<TransitionProof>,
    },
}

enum Command {
    Submit(Request),
    Snapshot { reply: oneshot::Sender<OperatorStatus> },
    Stop { reply: oneshot::Sender<ContextStats> },
}

struct RollupState {
    queue: PendingDepositStack,
    db: AccountDb,
}

impl RollupState {
    fn view(&self) -> StateView {
        StateView {
            state: snapshot(&self.queue, &self.db),
            accounts: self.db.layout(),
            account_count: self.db.len(),
            pending_deposits: self.queue.layout(),
        }
    }
}

/// Summary of the last committed state, served while a job holds the state.
#[derive(Clone, Copy)]
struct StateView {
    state: StateSnapshot,
    accounts: AccumulatorLayout,
    account_count: usize,
    pending_deposits: StackLayout,
}

enum Operation {
    Deposit,
    Transaction(Transaction, Signature),
}

impl Operation {
    fn run(
        self,
        ctx: &ProvingContext,
        state: &mut RollupState,
    ) -> Result<TransitionProof, RollupError> {
        match self {
            Operation::Deposit => process_deposit(ctx, &mut state.queue, &mut state.db),
            Operation::Transaction(tx, signature) => {
                apply_transaction(ctx, &tx, &signature, &state.queue, &mut state.db)
            }
        }
    }
}

enum Work {
    Apply(Operation),
    Settle(Option<Vec<TransitionProof>>),
}

/// What a proving task hands back.
struct Finished {
    /// The state the task took; `None` for settlements.
    state: Option<RollupState>,
    result: Result<TransitionProof, RollupError>,
}

struct Job {
    handle: JoinHandle<Finished>,
    cancel: watch::Receiver<bool>,
    /// Taken once the caller has been answered.
    reply: Option<Reply<TransitionProof>>,
    /// Number of journal entries consumed when this job settles the journal.
    settles: Option<usize>,
}

impl Job {
    fn respond(&mut self, result: Result<TransitionProof, OperatorError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

enum Outcome {
    Finished(Result<Finished, JoinError>),
    Cancelled,
}

/// The operator task.
pub struct Operator {
    /// `None` while a proving task holds it.
    state: Option<RollupState>,
    view: StateView,
    ctx: Arc<ProvingContext>,
    journal: Vec<TransitionProof>,
    last_settlement: Option<ProofDigest>,
}

impl Operator {
    pub fn new(config: &OperatorConfig) -> Result<Self, OperatorError> {
        let ctx = config
            .proving_context()
            .map_err(|e| OperatorError::Config(e.to_string()))?;
        Self::with_context(config.account_db_depth, ctx)
    }

    pub fn with_context(depth: u8, ctx: ProvingContext) -> Result<Self, OperatorError> {
        let state = RollupState {
            queue: PendingDepositStack::new(),
            db: AccountDb::new(depth).map_err(RollupError::from)?,
        };
        Ok(Self {
            view: state.view(),
            state: Some(state),
            ctx: Arc::new(ctx),
            journal: Vec::new(),
            last_settlement: None,
        })
    }

    /// Build an operator from `config` and spawn it.
    pub fn start(config: &OperatorConfig) -> Result<OperatorHandle, OperatorError> {
        Ok(Self::new(config)?.spawn(config.command_buffer))
    }

    /// Spawn the command loop on the current runtime.
    pub fn spawn(self, command_buffer: usize) -> OperatorHandle {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        tokio::spawn(self.run_loop(command_rx));
        OperatorHandle { command_tx }
    }

    async fn run_loop(mut self, mut command_rx: mpsc::Receiver<Command>) {
        let mut backlog: VecDeque<Request> = VecDeque::new();
        let mut in_flight: Option<Job> = None;
        let mut stop_reply = None;

        tracing::info!(
            depth = self.view.accounts.depth,
            accounts = %self.view.state.account_db_commitment,
            "rollup operator started"
        );

        loop {
            tokio::select! {
                command = command_rx.recv(), if stop_reply.is_none() => match command {
                    Some(Command::Submit(request)) => backlog.push_back(request),
                    Some(Command::Snapshot { reply }) => {
                        let _ = reply.send(self.status(in_flight.is_some(), backlog.len()));
                    }
                    Some(Command::Stop { reply }) => {
                        tracing::info!(pending_jobs = backlog.len(), "rollup operator stopping");
                        stop_reply = Some(reply);
                    }
                    None => break,
                },

                Some(outcome) = next_outcome(&mut in_flight), if in_flight.is_some() => match outcome {
                    Outcome::Cancelled => {
                        if let Some(job) = in_flight.as_mut() {
                            tracing::debug!("job cancelled while proving, awaiting its state");
                            job.respond(Err(OperatorError::Cancelled));
                        }
                    }
                    Outcome::Finished(joined) => {
                        if let Some(job) = in_flight.take() {
                            self.complete(job, joined);
                        }
                    }
                },
            }

            if in_flight.is_none() {
                if self.state.is_none() {
                    tracing::error!("rollup state lost, operator stopping");
                    break;
                }
                if stop_reply.is_some() {
                    break;
                }
            }

            while in_flight.is_none() && stop_reply.is_none() {
                let Some(request) = backlog.pop_front() else {
                    break;
                };
                in_flight = self.start_request(request);
            }
        }

        for request in backlog {
            request.reject(OperatorError::ChannelClosed);
        }

        self.ctx.shutdown();
        let stats = self.ctx.stats();
        tracing::info!(
            proofs_generated = stats.proofs_generated,
            proofs_verified = stats.proofs_verified,
            "rollup operator stopped"
        );
        if let Some(reply) = stop_reply {
            let _ = reply.send(stats);
        }
    }

    /// Apply `request`, returning the proving job it started, if any.
    fn start_request(&mut self, request: Request) -> Option<Job> {
        let (work, cancel, reply) = match request {
            Request::EnqueueDeposit { deposit, reply } => {
                let _ = reply.send(self.enqueue(deposit));
                return None;
            }
            Request::ProcessDeposit { cancel, reply } => {
                (Work::Apply(Operation::Deposit), cancel, reply)
            }
            Request::SubmitTransaction {
                tx,
                signature,
                cancel,
                reply,
            } => (
                Work::Apply(Operation::Transaction(tx, signature)),
                cancel,
                reply,
            ),
            Request::Settle {
                proofs,
                cancel,
                reply,
            } => (Work::Settle(proofs), cancel, reply),
        };

        if *cancel.borrow() {
            let _ = reply.send(Err(OperatorError::Cancelled));
            return None;
        }

        let ctx = Arc::clone(&self.ctx);
        let mut settles = None;
        let handle = match work {
            Work::Apply(operation) => {
                let Some(mut state) = self.state.take() else {
                    let _ = reply.send(Err(OperatorError::ChannelClosed));
                    return None;
                };
                tokio::task::spawn_blocking(move || {
                    let result = operation.run(&ctx, &mut state);
                    Finished {
                        state: Some(state),
                        result,
                    }
                })
            }
            Work::Settle(proofs) => {
                let proofs = match proofs {
                    Some(proofs) => proofs,
                    None => {
                        let run = chained_run(&self.journal);
                        settles = Some(run);
                        self.journal[..run].to_vec()
                    }
                };
                tokio::task::spawn_blocking(move || Finished {
                    state: None,
                    result: settle(&ctx, proofs),
                })
            }
        };

        Some(Job {
            handle,
            cancel,
            reply: Some(reply),
            settles,
        })
    }

    fn enqueue(&mut self, deposit: Deposit) -> Result<Commitment, OperatorError> {
        let state = self.state.as_mut().ok_or(OperatorError::ChannelClosed)?;
        let commitment = state.queue.push(deposit);
        self.view = state.view();
        tracing::debug!(
            public_key = %deposit.public_key,
            amount = deposit.amount,
            pending = state.queue.len(),
            "deposit enqueued"
        );
        Ok(commitment)
    }

    fn complete(&mut self, mut job: Job, joined: Result<Finished, JoinError>) {
        let Finished { state, result } = match joined {
            Ok(finished) => finished,
            Err(err) => {
                tracing::error!(error = %err, "proving task failed");
                job.respond(Err(OperatorError::TaskFailed(err.to_string())));
                return;
            }
        };
        let cancelled = job.reply.is_none() || *job.cancel.borrow();

        let result = match (state, result) {
            // Cancelled while proving: hand back the state as it was.
            (Some(mut state), Ok(proof)) if cancelled => {
                match revert(&proof, &mut state.queue, &mut state.db) {
                    Ok(()) => self.state = Some(state),
                    Err(err) => tracing::error!(error = %err, "failed to roll back cancelled job"),
                }
                Err(OperatorError::Cancelled)
            }
            (Some(state), Ok(proof)) => {
                self.view = state.view();
                self.state = Some(state);
                self.journal.push(proof.clone());
                Ok(proof)
            }
            (Some(state), Err(err)) => {
                self.state = Some(state);
                Err(err.into())
            }
            (None, Ok(_)) if cancelled => Err(OperatorError::Cancelled),
            (None, Ok(proof)) => {
                if let Some(consumed) = job.settles {
                    self.journal.drain(..consumed);
                    self.last_settlement = Some(proof.digest());
                }
                Ok(proof)
            }
            (None, Err(err)) => Err(err.into()),
        };

        match &result {
            Ok(proof) => {
                let transition = proof.public_input();
                tracing::debug!(
                    kind = ?proof.kind(),
                    steps = proof.steps(),
                    accounts = %transition.target.account_db_commitment,
                    pending = %transition.target.pending_deposits_commitment,
                    "proof committed"
                );
            }
            Err(err) => tracing::warn!(error = %err, "job rejected, state unchanged"),
        }
        job.respond(result);
    }

    fn status(&self, busy: bool, backlog: usize) -> OperatorStatus {
        OperatorStatus {
            state: self.view.state,
            accounts: self.view.accounts,
            account_count: self.view.account_count,
            pending_deposits: self.view.pending_deposits,
            unsettled_proofs: self.journal.len(),
            last_settlement: self.last_settlement,
            busy,
            backlog,
            proving: self.ctx.stats(),
        }
    }
}

impl Request {
    fn reject(self, err: OperatorError) {
        match self {
            Request::EnqueueDeposit { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::ProcessDeposit { reply, .. }
            | Request::SubmitTransaction { reply, .. }
            | Request::Settle { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Length of the journal prefix whose transitions chain end to end.
///
/// Enqueueing a deposit moves the pending commitment without a proof, so the
/// journal can only be settled one chained run at a time.
fn chained_run(journal: &[TransitionProof]) -> usize {
    if journal.is_empty() {
        return 0;
    }
    1 + journal
        .windows(2)
        .take_while(|w| w[0].public_input().chains_into(&w[1].public_input()))
        .count()
}

/// Wait for the running job to finish, or for its caller to cancel it.
/// Once the caller has been answered only completion is awaited.
async fn next_outcome(in_flight: &mut Option<Job>) -> Option<Outcome> {
    let job = in_flight.as_mut()?;
    if job.reply.is_none() {
        return Some(Outcome::Finished((&mut job.handle).await));
    }
    tokio::select! {
        joined = &mut job.handle => Some(Outcome::Finished(joined)),
        _ = cancelled(&mut job.cancel) => Some(Outcome::Cancelled),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Cloneable handle to a running operator.
#[derive(Clone)]
pub struct OperatorHandle {
    command_tx: mpsc::Sender<Command>,
}

impl OperatorHandle {
    /// Push a deposit onto the pending stack. Returns the new stack commitment.
    pub async fn enqueue_deposit(
        &self,
        public_key: PublicKey,
        amount: u64,
    ) -> Result<Commitment, OperatorError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::EnqueueDeposit {
            deposit: Deposit::new(public_key, amount),
            reply,
        })
        .await?;
        rx.await.map_err(|_| OperatorError::ChannelClosed)?
    }

    /// Process the top pending deposit.
    pub async fn process_deposit(&self) -> Result<TransitionProof, OperatorError> {
        self.process_deposit_cancellable().await?.wait().await
    }

    pub async fn process_deposit_cancellable(&self) -> Result<JobHandle, OperatorError> {
        let (job, cancel, reply) = JobHandle::new();
        self.submit(Request::ProcessDeposit { cancel, reply }).await?;
        Ok(job)
    }

    /// Apply a signed transaction.
    pub async fn submit_transaction(
        &self,
        tx: Transaction,
        signature: Signature,
    ) -> Result<TransitionProof, OperatorError> {
        self.submit_transaction_cancellable(tx, signature)
            .await?
            .wait()
            .await
    }

    pub async fn submit_transaction_cancellable(
        &self,
        tx: Transaction,
        signature: Signature,
    ) -> Result<JobHandle, OperatorError> {
        let (job, cancel, reply) = JobHandle::new();
        self.submit(Request::SubmitTransaction {
            tx,
            signature,
            cancel,
            reply,
        })
        .await?;
        Ok(job)
    }

    /// Settle the unsettled journal into one proof.
    pub async fn settle(&self) -> Result<TransitionProof, OperatorError> {
        self.settle_cancellable(None).await?.wait().await
    }

    /// Settle an explicit sequence of adjacent proofs.
    pub async fn settle_proofs(
        &self,
        proofs: Vec<TransitionProof>,
    ) -> Result<TransitionProof, OperatorError> {
        self.settle_cancellable(Some(proofs)).await?.wait().await
    }

    pub async fn settle_cancellable(
        &self,
        proofs: Option<Vec<TransitionProof>>,
    ) -> Result<JobHandle, OperatorError> {
        let (job, cancel, reply) = JobHandle::new();
        self.submit(Request::Settle {
            proofs,
            cancel,
            reply,
        })
        .await?;
        Ok(job)
    }

    pub async fn current_account_commitment(&self) -> Result<Commitment, OperatorError> {
        Ok(self.snapshot().await?.state.account_db_commitment)
    }

    pub async fn current_pending_commitment(&self) -> Result<Commitment, OperatorError> {
        Ok(self.snapshot().await?.state.pending_deposits_commitment)
    }

    pub async fn snapshot(&self) -> Result<OperatorStatus, OperatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| OperatorError::ChannelClosed)
    }

    /// Stop the operator once the running job finishes. Queued submissions
    /// are rejected.
    pub async fn stop(&self) -> Result<ContextStats, OperatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await.map_err(|_| OperatorError::ChannelClosed)
    }

    async fn submit(&self, request: Request) -> Result<(), OperatorError> {
        self.send(Command::Submit(request)).await
    }

    async fn send(&self, command: Command) -> Result<(), OperatorError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| OperatorError::ChannelClosed)
    }
}

/// A submitted proving job.
pub struct JobHandle {
    cancel: watch::Sender<bool>,
    reply: oneshot::Receiver<Result<TransitionProof, OperatorError>>,
}

impl JobHandle {
    fn new() -> (
        Self,
        watch::Receiver<bool>,
        oneshot::Sender<Result<TransitionProof, OperatorError>>,
    ) {
        let (cancel, cancel_rx) = watch::channel(false);
        let (reply, reply_rx) = oneshot::channel();
        (
            Self {
                cancel,
                reply: reply_rx,
            },
            cancel_rx,
            reply,
        )
    }

    /// Discard the job. State is left as if it had never been submitted.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub async fn wait(self) -> Result<TransitionProof, OperatorError> {
        self.reply.await.map_err(|_| OperatorError::ChannelClosed)?
    }
}
