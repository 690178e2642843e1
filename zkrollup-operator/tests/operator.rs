//! Integration tests for the operator task.

use std::time::Duration;

use zkrollup_operator::{Operator, OperatorError, OperatorHandle};
use zkrollup_state::{
    Blake3Backend, Keypair, ProofBackend, ProofError, ProofKind, ProvingContext, RollupError,
    Seal, Signature, Statement, Transaction, ValidationError,
};

// === Test Fixtures ===

const DEPTH: u8 = 32;

fn start() -> OperatorHandle {
    Operator::with_context(DEPTH, ProvingContext::from_seed(b"operator-tests"))
        .unwrap()
        .spawn(16)
}

/// Backend that takes a while to seal, so jobs stay in flight.
struct SlowBackend {
    inner: Blake3Backend,
    delay: Duration,
}

impl ProofBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn prove(&self, statement: &Statement) -> Result<Seal, ProofError> {
        std::thread::sleep(self.delay);
        self.inner.prove(statement)
    }

    fn verify(&self, statement: &Statement, seal: &Seal) -> bool {
        self.inner.verify(statement, seal)
    }
}

fn start_slow(delay: Duration) -> OperatorHandle {
    let backend = SlowBackend {
        inner: Blake3Backend::from_seed(b"slow"),
        delay,
    };
    Operator::with_context(DEPTH, ProvingContext::new(backend))
        .unwrap()
        .spawn(16)
}

fn keypair(b: u8) -> Keypair {
    Keypair::from_seed([b; 32])
}

fn signed(from: &Keypair, to: &Keypair, amount: u64, nonce: u32) -> (Transaction, Signature) {
    let tx = Transaction::new(amount, nonce, from.public_key(), to.public_key());
    let sig = from.sign_transaction(&tx);
    (tx, sig)
}

// === Lifecycle ===

#[tokio::test]
async fn deposit_transfer_settle_flow() {
    let operator = start();
    let alice = keypair(1);
    let bob = keypair(2);

    let initial = operator.snapshot().await.unwrap().state;

    let pending = operator.enqueue_deposit(alice.public_key(), 100).await.unwrap();
    assert_eq!(operator.current_pending_commitment().await.unwrap(), pending);

    let deposit = operator.process_deposit().await.unwrap();
    assert_eq!(deposit.kind(), ProofKind::Deposit);
    assert_eq!(
        operator.current_account_commitment().await.unwrap(),
        deposit.public_input().target.account_db_commitment
    );

    // Deposits open an empty account, so only zero-value transfers fit.
    let (tx, sig) = signed(&alice, &bob, 0, 0);
    let transfer = operator.submit_transaction(tx, sig).await.unwrap();
    assert_eq!(transfer.kind(), ProofKind::Transaction);

    let status = operator.snapshot().await.unwrap();
    assert_eq!(status.account_count, 2);
    assert_eq!(status.unsettled_proofs, 2);
    assert!(!status.busy);

    let settled = operator.settle().await.unwrap();
    assert_eq!(settled.kind(), ProofKind::Merge);
    assert_eq!(settled.steps(), 2);
    assert_eq!(settled.public_input().source, initial);
    assert_eq!(settled.public_input().target, status.state);

    let status = operator.snapshot().await.unwrap();
    assert_eq!(status.unsettled_proofs, 0);
    assert_eq!(status.last_settlement, Some(settled.digest()));
}

#[tokio::test]
async fn explicit_settlement_leaves_journal_alone() {
    let operator = start();
    operator.enqueue_deposit(keypair(1).public_key(), 1).await.unwrap();
    let proof = operator.process_deposit().await.unwrap();

    let settled = operator.settle_proofs(vec![proof.clone()]).await.unwrap();
    assert_eq!(settled, proof);
    assert_eq!(operator.snapshot().await.unwrap().unsettled_proofs, 1);
}

#[tokio::test]
async fn settlement_rejects_proofs_sealed_elsewhere() {
    let operator = start();
    let elsewhere = Operator::with_context(DEPTH, ProvingContext::from_seed(b"elsewhere"))
        .unwrap()
        .spawn(4);
    elsewhere.enqueue_deposit(keypair(1).public_key(), 1).await.unwrap();
    let foreign = elsewhere.process_deposit().await.unwrap();

    let err = operator.settle_proofs(vec![foreign]).await.unwrap_err();
    assert!(matches!(
        err,
        OperatorError::Rollup(RollupError::Proof(ProofError::VerificationFailed(_)))
    ));
    assert!(operator.snapshot().await.unwrap().last_settlement.is_none());
}

#[tokio::test]
async fn stop_reports_proving_stats() {
    let operator = start();
    operator.enqueue_deposit(keypair(1).public_key(), 1).await.unwrap();
    operator.process_deposit().await.unwrap();

    let stats = operator.stop().await.unwrap();
    assert_eq!(stats.proofs_generated, 1);
    assert!(!stats.open);
    assert!(matches!(
        operator.snapshot().await,
        Err(OperatorError::ChannelClosed)
    ));
}

// === Validation ===

#[tokio::test]
async fn rejected_operations_leave_state_unchanged() {
    let operator = start();
    let alice = keypair(1);
    let bob = keypair(2);

    let err = operator.process_deposit().await.unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(
        err,
        OperatorError::Rollup(RollupError::Validation(ValidationError::EmptyQueue))
    ));

    operator.enqueue_deposit(alice.public_key(), 5).await.unwrap();
    operator.process_deposit().await.unwrap();
    let before = operator.snapshot().await.unwrap();

    let (tx, sig) = signed(&alice, &bob, 1, 0);
    let err = operator.submit_transaction(tx, sig).await.unwrap_err();
    assert!(matches!(
        err,
        OperatorError::Rollup(RollupError::Validation(
            ValidationError::InsufficientBalance { balance: 0, amount: 1 }
        ))
    ));

    let (tx, sig) = signed(&alice, &bob, 0, 7);
    let err = operator.submit_transaction(tx, sig).await.unwrap_err();
    assert!(matches!(
        err,
        OperatorError::Rollup(RollupError::Validation(ValidationError::NonceMismatch {
            expected: 0,
            got: 7
        }))
    ));

    let (tx, _) = signed(&alice, &bob, 0, 0);
    let forged = bob.sign_transaction(&tx);
    let err = operator.submit_transaction(tx, forged).await.unwrap_err();
    assert!(err.is_validation());

    let after = operator.snapshot().await.unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.unsettled_proofs, before.unsettled_proofs);
}

#[tokio::test]
async fn settling_an_empty_journal_is_rejected() {
    let operator = start();
    let err = operator.settle().await.unwrap_err();
    assert!(matches!(
        err,
        OperatorError::Rollup(RollupError::Validation(ValidationError::EmptySettlement))
    ));
}

// === Cancellation ===

#[tokio::test]
async fn cancelled_job_is_discarded() {
    let operator = start_slow(Duration::from_millis(200));
    let alice = keypair(1);
    operator.enqueue_deposit(alice.public_key(), 1).await.unwrap();
    let before = operator.snapshot().await.unwrap();

    let job = operator.process_deposit_cancellable().await.unwrap();
    job.cancel();
    assert!(matches!(job.wait().await, Err(OperatorError::Cancelled)));

    let after = operator.snapshot().await.unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.unsettled_proofs, 0);

    // The deposit is still pending and can be processed normally.
    let proof = operator.process_deposit().await.unwrap();
    assert_eq!(proof.public_input().source, before.state);
}

#[tokio::test]
async fn cancelling_a_running_job_rolls_it_back() {
    let operator = start_slow(Duration::from_millis(200));
    operator.enqueue_deposit(keypair(1).public_key(), 1).await.unwrap();
    let before = operator.snapshot().await.unwrap();

    let job = operator.process_deposit_cancellable().await.unwrap();
    assert!(operator.snapshot().await.unwrap().busy);
    job.cancel();
    assert!(matches!(job.wait().await, Err(OperatorError::Cancelled)));
    assert_eq!(operator.snapshot().await.unwrap().state, before.state);

    // The deposit is back on the stack and replays from the same source.
    let proof = operator.process_deposit().await.unwrap();
    assert_eq!(proof.public_input().source, before.state);

    let after = operator.snapshot().await.unwrap();
    assert_eq!(after.account_count, 1);
    assert_eq!(after.unsettled_proofs, 1);
    assert_eq!(after.pending_deposits.length, 0);
}

#[tokio::test]
async fn reads_are_served_while_proving() {
    let operator = start_slow(Duration::from_millis(300));
    operator.enqueue_deposit(keypair(1).public_key(), 1).await.unwrap();
    let before = operator.snapshot().await.unwrap();

    let job = operator.process_deposit_cancellable().await.unwrap();
    let during = operator.snapshot().await.unwrap();
    assert!(during.busy);
    assert_eq!(during.state, before.state);

    let proof = job.wait().await.unwrap();
    let after = operator.snapshot().await.unwrap();
    assert!(!after.busy);
    assert_eq!(after.state, proof.public_input().target);
}

#[tokio::test]
async fn submissions_queue_behind_the_running_job() {
    let operator = start_slow(Duration::from_millis(100));
    let alice = keypair(1);
    let bob = keypair(2);
    operator.enqueue_deposit(bob.public_key(), 1).await.unwrap();
    operator.enqueue_deposit(alice.public_key(), 1).await.unwrap();

    let first = operator.process_deposit_cancellable().await.unwrap();
    let second = operator.process_deposit_cancellable().await.unwrap();

    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();
    assert!(first.public_input().chains_into(&second.public_input()));
    assert_eq!(operator.snapshot().await.unwrap().account_count, 2);
}
