//! Core rollup records.

use serde::{Deserialize, Serialize};

use crate::commitment::{CanonicalFields, Commitment, FieldEncoder};
use crate::keys::PublicKey;

/// Prefix of the signed transaction encoding.
pub const TRANSACTION_DOMAIN: &[u8] = b"zkrollup_tx_v1";

/// An account stored in the accumulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub balance: u64,
    pub nonce: u32,
    pub public_key: PublicKey,
}

impl AccountRecord {
    pub fn new(balance: u64, nonce: u32, public_key: PublicKey) -> Self {
        Self {
            balance,
            nonce,
            public_key,
        }
    }

    /// A fresh account: zero balance, zero nonce.
    pub fn empty(public_key: PublicKey) -> Self {
        Self::new(0, 0, public_key)
    }
}

impl CanonicalFields for AccountRecord {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.u64(self.balance).u32(self.nonce).field(&self.public_key);
    }
}

/// An incoming funding event waiting to be processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub public_key: PublicKey,
    pub amount: u64,
}

impl Deposit {
    pub fn new(public_key: PublicKey, amount: u64) -> Self {
        Self { public_key, amount }
    }
}

impl CanonicalFields for Deposit {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.field(&self.public_key).u64(self.amount);
    }
}

/// A transfer between two accounts. Always travels with a signature by `sender`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub amount: u64,
    pub nonce: u32,
    pub sender: PublicKey,
    pub receiver: PublicKey,
}

impl Transaction {
    pub fn new(amount: u64, nonce: u32, sender: PublicKey, receiver: PublicKey) -> Self {
        Self {
            amount,
            nonce,
            sender,
            receiver,
        }
    }

    /// The bytes a sender signs.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = TRANSACTION_DOMAIN.to_vec();
        bytes.extend_from_slice(&self.to_field_bytes());
        bytes
    }
}

impl CanonicalFields for Transaction {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.u64(self.amount)
            .u32(self.nonce)
            .field(&self.sender)
            .field(&self.receiver);
    }
}

/// Global rollup state at an instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub pending_deposits_commitment: Commitment,
    pub account_db_commitment: Commitment,
}

impl StateSnapshot {
    pub fn new(pending_deposits_commitment: Commitment, account_db_commitment: Commitment) -> Self {
        Self {
            pending_deposits_commitment,
            account_db_commitment,
        }
    }
}

impl CanonicalFields for StateSnapshot {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.field(&self.pending_deposits_commitment)
            .field(&self.account_db_commitment);
    }
}

/// The public claim of every proof: `source` was advanced to `target`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateTransition {
    pub source: StateSnapshot,
    pub target: StateSnapshot,
}

impl StateTransition {
    pub fn new(source: StateSnapshot, target: StateSnapshot) -> Self {
        Self { source, target }
    }

    /// Whether `next` starts exactly where `self` ends.
    pub fn chains_into(&self, next: &StateTransition) -> bool {
        self.target == next.source
    }
}

impl CanonicalFields for StateTransition {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.field(&self.source).field(&self.target);
    }
}
