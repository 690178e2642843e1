//! # zkrollup-state
//!
//! State-transition and recursive proof composition core of a layer-2 rollup.
//!
//! Accounts live in a keyed Merkle accumulator, incoming deposits wait on a
//! hash-chained stack, and every operation that advances the state emits a
//! proof binding a source [`StateSnapshot`] to a target one. Adjacent proofs
//! fold pairwise, so an operation log of any length settles as one
//! constant-size proof.
//!
//! ## Architecture
//!
//! ```text
//!   deposits            signed transactions
//!      │                        │
//!      ▼                        │
//! ┌───────────────────┐         │
//! │PendingDepositStack│         │
//! └─────────┬─────────┘         │
//!           ▼                   ▼
//! ┌──────────────────┐  ┌──────────────────────┐
//! │ process_deposit  │  │  apply_transaction   │
//! └─────────┬────────┘  └──────────┬───────────┘
//!           │   KeyedAccumulator   │
//!           ▼                      ▼
//!      TransitionProof ... TransitionProof
//!           │                      │
//!           └─────── merge ────────┘
//!                      │
//!                      ▼
//!              settled proof (source → target)
//! ```
//!
//! ## Proving
//!
//! All proving and verification goes through an explicit [`ProvingContext`].
//! Each variant's witness is checked by its circuit before the backend seals
//! the statement; a failed constraint aborts the operation and no state is
//! committed.

pub mod accumulator;
pub mod backend;
pub mod circuit;
pub mod commitment;
pub mod deposit_stack;
pub mod error;
pub mod keys;
pub mod merge;
pub mod processor;
pub mod proof;
pub mod types;

pub use accumulator::{
    AccumulatorLayout, KeyedAccumulator, Membership, MerkleWitness, Position, ACCOUNT_DB_DEPTH,
};
pub use backend::{Blake3Backend, ContextStats, ProofBackend, ProvingContext, Seal, Statement};
pub use circuit::{CircuitError, DepositWitness, MergeWitness, TransactionWitness, Witness};
pub use commitment::{CanonicalFields, Commitment, FieldEncoder};
pub use deposit_stack::{PendingDepositStack, StackLayout};
pub use error::{ConfigurationError, ProofError, Result, RollupError, ValidationError};
pub use keys::{Keypair, PublicKey, Signature};
pub use merge::{merge, settle, verify_all};
pub use processor::{apply_transaction, process_deposit, revert, snapshot, AccountDb};
pub use proof::{Proof, ProofDigest, ProofKind, TransitionProof};
pub use types::{AccountRecord, Deposit, StateSnapshot, StateTransition, Transaction};
