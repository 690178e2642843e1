//! Pending deposit stack.
//!
//! Deposits are hash-chained: the commitment after pushing `d` onto a stack
//! with commitment `c` is `H(stack_v1 || c || d)`, starting from
//! [`Commitment::ZERO`]. Popping removes the most recently pushed deposit and
//! restores the commitment below it.

use serde::{Deserialize, Serialize};

use crate::commitment::{CanonicalFields, Commitment, FieldEncoder, STACK_DOMAIN};
use crate::error::ValidationError;
use crate::types::Deposit;

/// Commitment of the stack obtained by pushing `deposit` onto `below`.
pub fn push_commitment(below: &Commitment, deposit: &Deposit) -> Commitment {
    struct Link<'a>(&'a Commitment, &'a Deposit);

    impl CanonicalFields for Link<'_> {
        fn write_fields(&self, out: &mut FieldEncoder) {
            out.field(self.0).field(self.1);
        }
    }

    Commitment::of(STACK_DOMAIN, &Link(below, deposit))
}

/// Stable persisted form of the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLayout {
    pub root: Commitment,
    pub length: u64,
}

#[derive(Clone, Debug)]
struct Entry {
    deposit: Deposit,
    below: Commitment,
}

/// LIFO queue of deposits awaiting processing.
///
/// Only [`StackLayout`] is persisted; the stack itself is rebuilt by pushing.
#[derive(Clone, Debug, Default)]
pub struct PendingDepositStack {
    entries: Vec<Entry>,
    commitment: Commitment,
}

impl PendingDepositStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn layout(&self) -> StackLayout {
        StackLayout {
            root: self.commitment,
            length: self.entries.len() as u64,
        }
    }

    pub fn push(&mut self, deposit: Deposit) -> Commitment {
        let below = self.commitment;
        self.commitment = push_commitment(&below, &deposit);
        self.entries.push(Entry { deposit, below });
        log::debug!(
            "deposit for {} queued ({} pending), stack -> {}",
            deposit.public_key,
            self.entries.len(),
            self.commitment
        );
        self.commitment
    }

    /// The deposit `pop` would return.
    pub fn peek(&self) -> Option<&Deposit> {
        self.entries.last().map(|e| &e.deposit)
    }

    /// The commitment `pop` would restore.
    pub fn commitment_below_top(&self) -> Option<Commitment> {
        self.entries.last().map(|e| e.below)
    }

    pub fn pop(&mut self) -> Result<Deposit, ValidationError> {
        let entry = self.entries.pop().ok_or(ValidationError::EmptyQueue)?;
        self.commitment = entry.below;
        Ok(entry.deposit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PublicKey;

    fn deposit(b: u8, amount: u64) -> Deposit {
        Deposit::new(PublicKey::from_bytes([b; 32]), amount)
    }

    #[test]
    fn pop_on_empty_stack_fails() {
        let mut stack = PendingDepositStack::new();
        assert_eq!(stack.pop().unwrap_err(), ValidationError::EmptyQueue);
        assert_eq!(stack.commitment(), Commitment::ZERO);
    }

    #[test]
    fn peek_shows_what_pop_returns() {
        let mut stack = PendingDepositStack::new();
        assert!(stack.peek().is_none());
        assert!(stack.commitment_below_top().is_none());

        let below = stack.push(deposit(1, 10));
        stack.push(deposit(2, 20));
        assert_eq!(stack.peek(), Some(&deposit(2, 20)));
        assert_eq!(stack.commitment_below_top(), Some(below));
        assert_eq!(stack.len(), 2);

        let top = *stack.peek().unwrap();
        assert_eq!(stack.pop().unwrap(), top);
        assert_eq!(stack.commitment(), below);
    }

    #[test]
    fn pop_returns_most_recent_deposit() {
        let mut stack = PendingDepositStack::new();
        stack.push(deposit(1, 10));
        stack.push(deposit(2, 20));

        assert_eq!(stack.pop().unwrap(), deposit(2, 20));
        assert_eq!(stack.pop().unwrap(), deposit(1, 10));
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_restores_previous_commitment() {
        let mut stack = PendingDepositStack::new();
        let c1 = stack.push(deposit(1, 10));
        let c2 = stack.push(deposit(2, 20));
        assert_ne!(c1, c2);
        assert_eq!(stack.commitment_below_top(), Some(c1));
        assert_eq!(push_commitment(&c1, &deposit(2, 20)), c2);

        stack.pop().unwrap();
        assert_eq!(stack.commitment(), c1);
        stack.pop().unwrap();
        assert_eq!(stack.commitment(), Commitment::ZERO);
    }

    #[test]
    fn commitment_is_order_sensitive() {
        let mut a = PendingDepositStack::new();
        a.push(deposit(1, 10));
        a.push(deposit(2, 20));

        let mut b = PendingDepositStack::new();
        b.push(deposit(2, 20));
        b.push(deposit(1, 10));

        assert_ne!(a.commitment(), b.commitment());
        assert_eq!(a.layout().length, 2);
    }
}
