//! Transition circuits.
//!
//! Each proof variant carries a private witness. Before a statement is sealed
//! the witness is synthesized against the public [`StateTransition`]: every
//! constraint below must hold or proof emission is aborted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accumulator::{key_index, leaf_hash, MerkleWitness};
use crate::backend::ProvingContext;
use crate::commitment::{CanonicalFields, Commitment, FieldEncoder, WITNESS_DOMAIN};
use crate::deposit_stack::push_commitment;
use crate::error::ProofError;
use crate::keys::{PublicKey, Signature};
use crate::proof::{ProofDigest, ProofKind};
use crate::types::{AccountRecord, Deposit, StateTransition, Transaction};

/// Private data of one proof variant.
pub trait Witness: CanonicalFields {
    const KIND: ProofKind;

    /// Number of deposit/transaction operations the proof covers.
    fn steps(&self) -> u64 {
        1
    }

    /// Binding commitment to the witness, sealed alongside the public input.
    fn commitment(&self) -> Commitment {
        struct Tagged<'a, W: ?Sized>(u8, &'a W);

        impl<W: CanonicalFields + ?Sized> CanonicalFields for Tagged<'_, W> {
            fn write_fields(&self, out: &mut FieldEncoder) {
                out.u8(self.0).field(self.1);
            }
        }

        Commitment::of(WITNESS_DOMAIN, &Tagged(Self::KIND.tag(), self))
    }

    /// Check every constraint of the variant against `public_input`.
    fn synthesize(
        &self,
        public_input: &StateTransition,
        ctx: &ProvingContext,
    ) -> Result<(), CircuitError>;
}

/// Witness for consuming the top pending deposit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositWitness {
    pub deposit: Deposit,
    /// Stack commitment after the pop.
    pub pending_after_pop: Commitment,
    /// Path to the depositor's (empty) leaf under the source root.
    pub leaf: MerkleWitness,
    /// The record written to the leaf.
    pub account: AccountRecord,
}

impl CanonicalFields for DepositWitness {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.field(&self.deposit)
            .field(&self.pending_after_pop)
            .field(&self.leaf)
            .field(&self.account);
    }
}

impl Witness for DepositWitness {
    const KIND: ProofKind = ProofKind::Deposit;

    fn synthesize(
        &self,
        public_input: &StateTransition,
        _ctx: &ProvingContext,
    ) -> Result<(), CircuitError> {
        let (source, target) = (&public_input.source, &public_input.target);
        let key = &self.deposit.public_key;

        // The deposit sat on top of the source stack
        if push_commitment(&self.pending_after_pop, &self.deposit)
            != source.pending_deposits_commitment
        {
            return Err(CircuitError::violation("deposit is not the top of the source stack"));
        }
        if target.pending_deposits_commitment != self.pending_after_pop {
            return Err(CircuitError::violation("target stack is not the popped stack"));
        }

        check_leaf_index(&self.leaf, key)?;

        // Non-membership under the source root
        if self.leaf.root_with(Commitment::ZERO) != source.account_db_commitment {
            return Err(CircuitError::violation("depositor leaf is not empty under source root"));
        }

        if self.account != AccountRecord::empty(*key) {
            return Err(CircuitError::violation("new account must start at zero balance and nonce"));
        }

        if self.leaf.root_with(leaf_hash(key, &self.account)) != target.account_db_commitment {
            return Err(CircuitError::RootMismatch("deposit target"));
        }

        Ok(())
    }
}

/// Witness for a signed transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionWitness {
    pub tx: Transaction,
    pub signature: Signature,
    pub sender_before: AccountRecord,
    /// Sender path under the source root.
    pub sender_path: MerkleWitness,
    /// `None` when the receiver account is created by this transfer.
    pub receiver_before: Option<AccountRecord>,
    /// Receiver path under the root obtained after the sender update.
    pub receiver_path: MerkleWitness,
}

impl CanonicalFields for TransactionWitness {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.field(&self.tx)
            .field(&self.signature)
            .field(&self.sender_before)
            .field(&self.sender_path);
        match &self.receiver_before {
            Some(record) => out.u8(1).field(record),
            None => out.u8(0),
        };
        out.field(&self.receiver_path);
    }
}

impl Witness for TransactionWitness {
    const KIND: ProofKind = ProofKind::Transaction;

    fn synthesize(
        &self,
        public_input: &StateTransition,
        _ctx: &ProvingContext,
    ) -> Result<(), CircuitError> {
        let (source, target) = (&public_input.source, &public_input.target);
        let tx = &self.tx;

        if !self.signature.verify(&tx.sender, &tx.signing_bytes()) {
            return Err(CircuitError::InvalidSignature);
        }

        // Transfers never touch the deposit stack
        if source.pending_deposits_commitment != target.pending_deposits_commitment {
            return Err(CircuitError::violation("pending deposits changed by a transfer"));
        }

        // Sender inclusion under the source root
        check_leaf_index(&self.sender_path, &tx.sender)?;
        if self.sender_path.root_with(leaf_hash(&tx.sender, &self.sender_before))
            != source.account_db_commitment
        {
            return Err(CircuitError::RootMismatch("sender inclusion"));
        }

        if self.sender_before.nonce != tx.nonce {
            return Err(CircuitError::violation("sender nonce does not match"));
        }

        let balance = self
            .sender_before
            .balance
            .checked_sub(tx.amount)
            .ok_or_else(|| CircuitError::violation("sender balance below amount"))?;
        let nonce = self
            .sender_before
            .nonce
            .checked_add(1)
            .ok_or_else(|| CircuitError::violation("sender nonce overflow"))?;
        let sender_after = AccountRecord {
            balance,
            nonce,
            ..self.sender_before
        };
        let intermediate = self
            .sender_path
            .root_with(leaf_hash(&tx.sender, &sender_after));

        // Receiver path is taken after the sender update
        check_leaf_index(&self.receiver_path, &tx.receiver)?;
        let receiver_leaf = match &self.receiver_before {
            Some(record) => leaf_hash(&tx.receiver, record),
            None => Commitment::ZERO,
        };
        if self.receiver_path.root_with(receiver_leaf) != intermediate {
            return Err(CircuitError::RootMismatch("receiver path"));
        }

        let mut receiver_after = self
            .receiver_before
            .unwrap_or_else(|| AccountRecord::empty(tx.receiver));
        receiver_after.balance = receiver_after
            .balance
            .checked_add(tx.amount)
            .ok_or_else(|| CircuitError::violation("receiver balance overflow"))?;

        if self
            .receiver_path
            .root_with(leaf_hash(&tx.receiver, &receiver_after))
            != target.account_db_commitment
        {
            return Err(CircuitError::RootMismatch("transaction target"));
        }

        Ok(())
    }
}

/// Witness for folding two adjacent proofs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeWitness {
    pub left: ProofDigest,
    pub right: ProofDigest,
}

impl CanonicalFields for MergeWitness {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.field(&self.left).field(&self.right);
    }
}

impl Witness for MergeWitness {
    const KIND: ProofKind = ProofKind::Merge;

    fn steps(&self) -> u64 {
        self.left.steps.saturating_add(self.right.steps)
    }

    fn synthesize(
        &self,
        public_input: &StateTransition,
        ctx: &ProvingContext,
    ) -> Result<(), CircuitError> {
        // Recursive verification of both children
        self.left.verify(ctx).map_err(CircuitError::InvalidChild)?;
        self.right.verify(ctx).map_err(CircuitError::InvalidChild)?;

        let (left, right) = (&self.left.public_input, &self.right.public_input);
        if !left.chains_into(right) {
            return Err(CircuitError::violation("left target is not right source"));
        }

        if *public_input != StateTransition::new(left.source, right.target) {
            return Err(CircuitError::violation("merged public input does not span children"));
        }

        Ok(())
    }
}

fn check_leaf_index(path: &MerkleWitness, key: &PublicKey) -> Result<(), CircuitError> {
    let depth = u8::try_from(path.depth())
        .map_err(|_| CircuitError::violation("witness path too deep"))?;
    if path.index != key_index(key, depth) {
        return Err(CircuitError::violation("witness path is not at the key's leaf index"));
    }
    Ok(())
}

/// Circuit errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Root mismatch: {0}")]
    RootMismatch(&'static str),

    #[error("Invalid child proof: {0}")]
    InvalidChild(ProofError),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

impl CircuitError {
    fn violation(msg: &str) -> Self {
        CircuitError::ConstraintViolation(msg.to_string())
    }
}

impl From<CircuitError> for ProofError {
    fn from(err: CircuitError) -> Self {
        ProofError::ConstraintViolation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::KeyedAccumulator;
    use crate::keys::Keypair;
    use crate::types::StateSnapshot;

    type AccountDb = KeyedAccumulator<PublicKey, AccountRecord>;

    fn deposit_case() -> (DepositWitness, StateTransition) {
        let pk = PublicKey::from_bytes([7; 32]);
        let deposit = Deposit::new(pk, 100);
        let mut db = AccountDb::new(8).unwrap();

        let source_pending = push_commitment(&Commitment::ZERO, &deposit);
        let source_root = db.commitment();
        let (_, pos) = db.get(&pk).unwrap();
        let leaf = db.witness(&pos).unwrap();
        let account = AccountRecord::empty(pk);
        let target_root = db.set(&pos, account).unwrap();

        let witness = DepositWitness {
            deposit,
            pending_after_pop: Commitment::ZERO,
            leaf,
            account,
        };
        let transition = StateTransition::new(
            StateSnapshot::new(source_pending, source_root),
            StateSnapshot::new(Commitment::ZERO, target_root),
        );
        (witness, transition)
    }

    #[test]
    fn deposit_witness_satisfies_its_transition() {
        let ctx = ProvingContext::from_seed(b"circuit");
        let (witness, transition) = deposit_case();
        assert!(witness.synthesize(&transition, &ctx).is_ok());
    }

    #[test]
    fn deposit_that_credits_balance_is_rejected() {
        let ctx = ProvingContext::from_seed(b"circuit");
        let (mut witness, transition) = deposit_case();
        witness.account.balance = 100;
        assert!(matches!(
            witness.synthesize(&transition, &ctx),
            Err(CircuitError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn deposit_with_wrong_target_root_is_rejected() {
        let ctx = ProvingContext::from_seed(b"circuit");
        let (witness, mut transition) = deposit_case();
        transition.target.account_db_commitment = Commitment::from_bytes([1; 32]);
        assert_eq!(
            witness.synthesize(&transition, &ctx),
            Err(CircuitError::RootMismatch("deposit target"))
        );
    }

    #[test]
    fn forged_signature_fails_before_any_root_check() {
        let ctx = ProvingContext::from_seed(b"circuit");
        let alice = Keypair::from_seed([1; 32]);
        let mallory = Keypair::from_seed([2; 32]);
        let tx = Transaction::new(1, 0, alice.public_key(), mallory.public_key());

        let db = AccountDb::new(8).unwrap();
        let (_, pos) = db.get(&alice.public_key()).unwrap();
        let path = db.witness(&pos).unwrap();
        let witness = TransactionWitness {
            tx,
            signature: mallory.sign_transaction(&tx),
            sender_before: AccountRecord::empty(alice.public_key()),
            sender_path: path.clone(),
            receiver_before: None,
            receiver_path: path,
        };

        assert_eq!(
            witness.synthesize(&StateTransition::default(), &ctx),
            Err(CircuitError::InvalidSignature)
        );
    }

    #[test]
    fn witness_commitment_depends_on_kind_and_content() {
        let (witness, _) = deposit_case();
        let mut other = witness.clone();
        other.deposit.amount = 1;
        assert_ne!(witness.commitment(), other.commitment());
        assert_eq!(witness.commitment(), witness.clone().commitment());
    }
}
