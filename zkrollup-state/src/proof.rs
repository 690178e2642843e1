//! Transition proofs.
//!
//! A [`TransitionProof`] is one of three variants, all exposing the same
//! [`StateTransition`] public input. Only the private witness differs.

use serde::{Deserialize, Serialize};

use crate::backend::{ProvingContext, Seal, Statement};
use crate::circuit::{DepositWitness, MergeWitness, TransactionWitness, Witness};
use crate::commitment::{CanonicalFields, Commitment, FieldEncoder};
use crate::error::ProofError;
use crate::types::StateTransition;

/// Proof variant tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    Deposit,
    Transaction,
    Merge,
}

impl ProofKind {
    pub fn tag(self) -> u8 {
        match self {
            ProofKind::Deposit => 0,
            ProofKind::Transaction => 1,
            ProofKind::Merge => 2,
        }
    }
}

/// A sealed proof with its private witness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof<W> {
    pub public_input: StateTransition,
    pub witness: W,
    pub steps: u64,
    pub seal: Seal,
}

impl<W: Witness> Proof<W> {
    /// Synthesize `witness` against `public_input` and seal the result.
    pub fn create(
        ctx: &ProvingContext,
        public_input: StateTransition,
        witness: W,
    ) -> Result<Self, ProofError> {
        let seal = ctx.prove(&public_input, &witness)?;
        Ok(Self {
            public_input,
            steps: witness.steps(),
            witness,
            seal,
        })
    }

    pub fn statement(&self) -> Statement {
        Statement {
            kind: W::KIND,
            public_input: self.public_input,
            witness_commitment: self.witness.commitment(),
            steps: self.steps,
        }
    }

    pub fn digest(&self) -> ProofDigest {
        ProofDigest::new(&self.statement(), self.seal)
    }

    pub fn verify(&self, ctx: &ProvingContext) -> Result<(), ProofError> {
        ctx.check(&self.statement(), &self.seal)
    }
}

/// Witness-free form of a proof: what a verifier or a merge consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofDigest {
    pub kind: ProofKind,
    pub public_input: StateTransition,
    pub witness_commitment: Commitment,
    pub steps: u64,
    pub seal: Seal,
}

impl ProofDigest {
    fn new(statement: &Statement, seal: Seal) -> Self {
        Self {
            kind: statement.kind,
            public_input: statement.public_input,
            witness_commitment: statement.witness_commitment,
            steps: statement.steps,
            seal,
        }
    }

    pub fn statement(&self) -> Statement {
        Statement {
            kind: self.kind,
            public_input: self.public_input,
            witness_commitment: self.witness_commitment,
            steps: self.steps,
        }
    }

    pub fn verify(&self, ctx: &ProvingContext) -> Result<(), ProofError> {
        ctx.check(&self.statement(), &self.seal)
    }
}

impl CanonicalFields for ProofDigest {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.u8(self.kind.tag())
            .field(&self.public_input)
            .field(&self.witness_commitment)
            .u64(self.steps)
            .field(&self.seal);
    }
}

/// Any proof emitted by the rollup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "proof", rename_all = "snake_case")]
pub enum TransitionProof {
    Deposit(Proof<DepositWitness>),
    Transaction(Proof<TransactionWitness>),
    Merge(Proof<MergeWitness>),
}

impl TransitionProof {
    pub fn kind(&self) -> ProofKind {
        match self {
            TransitionProof::Deposit(_) => ProofKind::Deposit,
            TransitionProof::Transaction(_) => ProofKind::Transaction,
            TransitionProof::Merge(_) => ProofKind::Merge,
        }
    }

    pub fn public_input(&self) -> StateTransition {
        match self {
            TransitionProof::Deposit(p) => p.public_input,
            TransitionProof::Transaction(p) => p.public_input,
            TransitionProof::Merge(p) => p.public_input,
        }
    }

    /// Number of deposit/transaction operations covered.
    pub fn steps(&self) -> u64 {
        match self {
            TransitionProof::Deposit(p) => p.steps,
            TransitionProof::Transaction(p) => p.steps,
            TransitionProof::Merge(p) => p.steps,
        }
    }

    pub fn seal(&self) -> Seal {
        match self {
            TransitionProof::Deposit(p) => p.seal,
            TransitionProof::Transaction(p) => p.seal,
            TransitionProof::Merge(p) => p.seal,
        }
    }

    pub fn digest(&self) -> ProofDigest {
        match self {
            TransitionProof::Deposit(p) => p.digest(),
            TransitionProof::Transaction(p) => p.digest(),
            TransitionProof::Merge(p) => p.digest(),
        }
    }

    /// Check the seal. Read-only.
    pub fn verify(&self, ctx: &ProvingContext) -> Result<(), ProofError> {
        match self {
            TransitionProof::Deposit(p) => p.verify(ctx),
            TransitionProof::Transaction(p) => p.verify(ctx),
            TransitionProof::Merge(p) => p.verify(ctx),
        }
    }
}
