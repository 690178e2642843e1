//! Deposit and transaction processing.
//!
//! Both processors capture the source snapshot, mutate the account database
//! (and, for deposits, the pending stack), capture the target snapshot and
//! seal a proof of the transition. If validation or proving fails every
//! mutation is undone, so callers observe either the full transition or none.

use crate::accumulator::{KeyedAccumulator, MerkleWitness, Position};
use crate::backend::ProvingContext;
use crate::circuit::{DepositWitness, TransactionWitness};
use crate::commitment::Commitment;
use crate::deposit_stack::PendingDepositStack;
use crate::error::{Result, RollupError, ValidationError};
use crate::keys::{PublicKey, Signature};
use crate::proof::{Proof, TransitionProof};
use crate::types::{AccountRecord, Deposit, StateSnapshot, StateTransition, Transaction};

/// The rollup account database.
pub type AccountDb = KeyedAccumulator<PublicKey, AccountRecord>;

/// Current global state.
pub fn snapshot(queue: &PendingDepositStack, db: &AccountDb) -> StateSnapshot {
    StateSnapshot::new(queue.commitment(), db.commitment())
}

/// Pop the top pending deposit and open an account for its key.
///
/// The deposit amount is not credited; the account starts at zero balance.
pub fn process_deposit(
    ctx: &ProvingContext,
    queue: &mut PendingDepositStack,
    db: &mut AccountDb,
) -> Result<TransitionProof> {
    let source = snapshot(queue, db);
    let deposit = queue.pop()?;

    match open_account(ctx, source, deposit, queue.commitment(), db) {
        Ok(proof) => {
            log::debug!(
                "deposit for {} processed, accounts -> {}",
                deposit.public_key,
                db.commitment()
            );
            Ok(proof)
        }
        Err(err) => {
            queue.push(deposit);
            log::warn!("deposit for {} rejected: {}", deposit.public_key, err);
            Err(err)
        }
    }
}

fn open_account(
    ctx: &ProvingContext,
    source: StateSnapshot,
    deposit: Deposit,
    pending_after_pop: Commitment,
    db: &mut AccountDb,
) -> Result<TransitionProof> {
    let (membership, position) = db.get(&deposit.public_key)?;
    if membership.present {
        return Err(ValidationError::DuplicateAccount(deposit.public_key).into());
    }

    let leaf = db.witness(&position)?;
    let account = AccountRecord::empty(deposit.public_key);
    db.set(&position, account)?;

    let target = StateSnapshot::new(pending_after_pop, db.commitment());
    let witness = DepositWitness {
        deposit,
        pending_after_pop,
        leaf,
        account,
    };

    match Proof::create(ctx, StateTransition::new(source, target), witness) {
        Ok(proof) => Ok(TransitionProof::Deposit(proof)),
        Err(err) => {
            undo(db, &position, None);
            Err(err.into())
        }
    }
}

/// Apply a signed transfer from `tx.sender` to `tx.receiver`.
///
/// The receiver account is created if absent. The pending stack is read only.
pub fn apply_transaction(
    ctx: &ProvingContext,
    tx: &Transaction,
    signature: &Signature,
    queue: &PendingDepositStack,
    db: &mut AccountDb,
) -> Result<TransitionProof> {
    let result = transfer(ctx, tx, signature, queue.commitment(), db);
    match &result {
        Ok(_) => log::debug!(
            "transfer {} -> {} ({}) applied, accounts -> {}",
            tx.sender,
            tx.receiver,
            tx.amount,
            db.commitment()
        ),
        Err(err) => log::warn!("transaction from {} rejected: {}", tx.sender, err),
    }
    result
}

fn transfer(
    ctx: &ProvingContext,
    tx: &Transaction,
    signature: &Signature,
    pending: Commitment,
    db: &mut AccountDb,
) -> Result<TransitionProof> {
    if !signature.verify(&tx.sender, &tx.signing_bytes()) {
        return Err(ValidationError::InvalidSignature(tx.sender).into());
    }

    let source = StateSnapshot::new(pending, db.commitment());

    let (sender_info, sender_pos) = db.get(&tx.sender)?;
    if !sender_info.present {
        return Err(ValidationError::AccountNotFound(tx.sender).into());
    }
    let sender_before = sender_info.value;
    if sender_before.nonce != tx.nonce {
        return Err(ValidationError::NonceMismatch {
            expected: sender_before.nonce,
            got: tx.nonce,
        }
        .into());
    }

    let balance = sender_before.balance.checked_sub(tx.amount).ok_or(
        ValidationError::InsufficientBalance {
            balance: sender_before.balance,
            amount: tx.amount,
        },
    )?;
    let nonce = sender_before
        .nonce
        .checked_add(1)
        .ok_or(ValidationError::NonceOverflow(tx.sender))?;
    let sender_after = AccountRecord {
        balance,
        nonce,
        ..sender_before
    };

    let sender_path = db.witness(&sender_pos)?;
    db.set(&sender_pos, sender_after)?;

    let credited = credit_receiver(ctx, tx, signature, source, sender_before, sender_path, db);
    if credited.is_err() {
        undo(db, &sender_pos, Some(sender_before));
    }
    credited
}

fn credit_receiver(
    ctx: &ProvingContext,
    tx: &Transaction,
    signature: &Signature,
    source: StateSnapshot,
    sender_before: AccountRecord,
    sender_path: MerkleWitness,
    db: &mut AccountDb,
) -> Result<TransitionProof> {
    let (receiver_info, receiver_pos) = db.get(&tx.receiver)?;
    let receiver_before = receiver_info.present.then_some(receiver_info.value);

    let mut receiver_after = receiver_before.unwrap_or_else(|| AccountRecord::empty(tx.receiver));
    receiver_after.balance = receiver_after
        .balance
        .checked_add(tx.amount)
        .ok_or(ValidationError::BalanceOverflow(tx.receiver))?;

    let receiver_path = db.witness(&receiver_pos)?;
    db.set(&receiver_pos, receiver_after)?;

    let target = StateSnapshot::new(source.pending_deposits_commitment, db.commitment());
    let witness = TransactionWitness {
        tx: *tx,
        signature: *signature,
        sender_before,
        sender_path,
        receiver_before,
        receiver_path,
    };

    match Proof::create(ctx, StateTransition::new(source, target), witness) {
        Ok(proof) => Ok(TransitionProof::Transaction(proof)),
        Err(err) => {
            undo(db, &receiver_pos, receiver_before);
            Err(RollupError::from(err))
        }
    }
}

/// Roll back `proof`, the last deposit or transaction applied to `queue` and
/// `db`. Merge proofs are never applied, so they are rejected.
///
/// The state must sit exactly at the proof's target and is left exactly at
/// its source.
pub fn revert(
    proof: &TransitionProof,
    queue: &mut PendingDepositStack,
    db: &mut AccountDb,
) -> Result<()> {
    let transition = proof.public_input();
    let current = snapshot(queue, db);
    if current != transition.target || matches!(proof, TransitionProof::Merge(_)) {
        return Err(ValidationError::ChainMismatch {
            left_target: transition.target,
            right_source: current,
        }
        .into());
    }

    match proof {
        TransitionProof::Deposit(p) => {
            let deposit = p.witness.deposit;
            let (_, position) = db.get(&deposit.public_key)?;
            db.restore(&position, None)?;
            queue.push(deposit);
        }
        TransitionProof::Transaction(p) => {
            let w = &p.witness;
            let (_, receiver) = db.get(&w.tx.receiver)?;
            db.restore(&receiver, w.receiver_before)?;
            let (_, sender) = db.get(&w.tx.sender)?;
            db.restore(&sender, Some(w.sender_before))?;
        }
        TransitionProof::Merge(_) => {}
    }

    let restored = snapshot(queue, db);
    if restored != transition.source {
        return Err(ValidationError::ChainMismatch {
            left_target: restored,
            right_source: transition.source,
        }
        .into());
    }
    log::debug!(
        "{:?} proof reverted, accounts -> {}",
        proof.kind(),
        restored.account_db_commitment
    );
    Ok(())
}

fn undo(db: &mut AccountDb, position: &Position<PublicKey>, previous: Option<AccountRecord>) {
    if let Err(err) = db.restore(position, previous) {
        log::error!("failed to roll back leaf {}: {}", position.index(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProofError;
    use crate::keys::Keypair;

    fn setup() -> (ProvingContext, PendingDepositStack, AccountDb) {
        (
            ProvingContext::from_seed(b"processor"),
            PendingDepositStack::new(),
            AccountDb::new(32).unwrap(),
        )
    }

    #[test]
    fn empty_queue_is_rejected() {
        let (ctx, mut queue, mut db) = setup();
        assert_eq!(
            process_deposit(&ctx, &mut queue, &mut db).unwrap_err(),
            RollupError::Validation(ValidationError::EmptyQueue)
        );
    }

    #[test]
    fn failed_proof_leaves_state_untouched() {
        let (ctx, mut queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]).public_key();
        queue.push(Deposit::new(alice, 10));
        let before = snapshot(&queue, &db);

        ctx.shutdown();
        assert_eq!(
            process_deposit(&ctx, &mut queue, &mut db).unwrap_err(),
            RollupError::Proof(ProofError::ContextClosed)
        );
        assert_eq!(snapshot(&queue, &db), before);
        assert_eq!(queue.len(), 1);
        assert!(db.is_empty());
    }

    #[test]
    fn failed_transfer_proof_restores_both_accounts() {
        let (ctx, queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]);
        let bob = Keypair::from_seed([2; 32]).public_key();

        let (_, pos) = db.get(&alice.public_key()).unwrap();
        db.set(&pos, AccountRecord::new(50, 0, alice.public_key())).unwrap();
        let before = snapshot(&queue, &db);

        let tx = Transaction::new(10, 0, alice.public_key(), bob);
        let sig = alice.sign_transaction(&tx);
        ctx.shutdown();
        assert!(apply_transaction(&ctx, &tx, &sig, &queue, &mut db).is_err());

        assert_eq!(snapshot(&queue, &db), before);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn revert_undoes_a_deposit() {
        let (ctx, mut queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]).public_key();
        queue.push(Deposit::new(alice, 10));

        let proof = process_deposit(&ctx, &mut queue, &mut db).unwrap();
        revert(&proof, &mut queue, &mut db).unwrap();

        assert_eq!(snapshot(&queue, &db), proof.public_input().source);
        assert_eq!(queue.peek(), Some(&Deposit::new(alice, 10)));
        assert!(db.is_empty());
    }

    #[test]
    fn revert_undoes_a_transfer_to_a_new_account() {
        let (ctx, mut queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]);
        let bob = Keypair::from_seed([2; 32]).public_key();
        let (_, pos) = db.get(&alice.public_key()).unwrap();
        db.set(&pos, AccountRecord::new(50, 0, alice.public_key())).unwrap();

        let tx = Transaction::new(20, 0, alice.public_key(), bob);
        let proof = apply_transaction(&ctx, &tx, &alice.sign_transaction(&tx), &queue, &mut db)
            .unwrap();
        revert(&proof, &mut queue, &mut db).unwrap();

        assert_eq!(snapshot(&queue, &db), proof.public_input().source);
        assert_eq!(db.len(), 1);
        let (info, _) = db.get(&alice.public_key()).unwrap();
        assert_eq!(info.value, AccountRecord::new(50, 0, alice.public_key()));
    }

    #[test]
    fn revert_requires_the_proof_target_state() {
        let (ctx, mut queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]).public_key();
        queue.push(Deposit::new(alice, 10));
        let proof = process_deposit(&ctx, &mut queue, &mut db).unwrap();
        queue.push(Deposit::new(alice, 5));
        let before = snapshot(&queue, &db);

        assert!(matches!(
            revert(&proof, &mut queue, &mut db),
            Err(RollupError::Validation(ValidationError::ChainMismatch { .. }))
        ));
        assert_eq!(snapshot(&queue, &db), before);
    }

    #[test]
    fn self_transfer_only_bumps_nonce() {
        let (ctx, queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]);
        let (_, pos) = db.get(&alice.public_key()).unwrap();
        db.set(&pos, AccountRecord::new(50, 0, alice.public_key())).unwrap();

        let tx = Transaction::new(20, 0, alice.public_key(), alice.public_key());
        let proof = apply_transaction(&ctx, &tx, &alice.sign_transaction(&tx), &queue, &mut db)
            .unwrap();

        assert!(proof.verify(&ctx).is_ok());
        let (info, _) = db.get(&alice.public_key()).unwrap();
        assert_eq!(info.value, AccountRecord::new(50, 1, alice.public_key()));
    }

    #[test]
    fn receiver_overflow_is_rejected() {
        let (ctx, queue, mut db) = setup();
        let alice = Keypair::from_seed([1; 32]);
        let bob = Keypair::from_seed([2; 32]).public_key();
        for (key, balance) in [(alice.public_key(), 10), (bob, u64::MAX)] {
            let (_, pos) = db.get(&key).unwrap();
            db.set(&pos, AccountRecord::new(balance, 0, key)).unwrap();
        }
        let before = db.commitment();

        let tx = Transaction::new(1, 0, alice.public_key(), bob);
        let err = apply_transaction(&ctx, &tx, &alice.sign_transaction(&tx), &queue, &mut db)
            .unwrap_err();

        assert_eq!(err, RollupError::Validation(ValidationError::BalanceOverflow(bob)));
        assert_eq!(db.commitment(), before);
    }
}
