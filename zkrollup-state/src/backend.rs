//! Proving context and the opaque proof backend.
//!
//! The rollup core never looks inside the proof system. It hands a
//! [`Statement`] to a [`ProofBackend`] after the variant's circuit has
//! accepted its witness, and receives a constant-size [`Seal`] back.
//! [`Blake3Backend`] seals statements with a keyed BLAKE3 hash and stands in
//! for a real recursive SNARK.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::circuit::Witness;
use crate::commitment::{CanonicalFields, Commitment, FieldEncoder};
use crate::error::ProofError;
use crate::proof::ProofKind;
use crate::types::StateTransition;

const STATEMENT_DOMAIN: &[u8] = b"zkrollup_statement_v1";
const PROVING_KEY_CONTEXT: &str = "zkrollup blake3 proving key v1";

/// What a seal attests to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: ProofKind,
    pub public_input: StateTransition,
    pub witness_commitment: Commitment,
    pub steps: u64,
}

impl CanonicalFields for Statement {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.u8(self.kind.tag())
            .field(&self.public_input)
            .field(&self.witness_commitment)
            .u64(self.steps);
    }
}

/// Constant-size proof produced by a backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seal([u8; 32]);

impl Seal {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Seal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seal(0x{})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Seal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Seal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let c = Commitment::deserialize(deserializer)?;
        Ok(Seal(c.to_bytes()))
    }
}

impl CanonicalFields for Seal {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.bytes32(&self.0);
    }
}

/// The proving/verifying capability the rollup invokes.
pub trait ProofBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn prove(&self, statement: &Statement) -> Result<Seal, ProofError>;

    fn verify(&self, statement: &Statement, seal: &Seal) -> bool;
}

/// Keyed-BLAKE3 sealing backend.
pub struct Blake3Backend {
    key: [u8; 32],
}

impl Blake3Backend {
    pub fn from_seed(seed: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(PROVING_KEY_CONTEXT, seed),
        }
    }

    pub fn random() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    fn tag(&self, statement: &Statement) -> blake3::Hash {
        let mut bytes = STATEMENT_DOMAIN.to_vec();
        bytes.extend_from_slice(&statement.to_field_bytes());
        blake3::keyed_hash(&self.key, &bytes)
    }
}

impl ProofBackend for Blake3Backend {
    fn name(&self) -> &'static str {
        "blake3-keyed"
    }

    fn prove(&self, statement: &Statement) -> Result<Seal, ProofError> {
        Ok(Seal(*self.tag(statement).as_bytes()))
    }

    fn verify(&self, statement: &Statement, seal: &Seal) -> bool {
        // blake3::Hash equality is constant-time.
        self.tag(statement) == blake3::Hash::from(seal.0)
    }
}

/// Counters reported by a context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub backend: String,
    pub proofs_generated: u64,
    pub proofs_verified: u64,
    pub open: bool,
}

/// Explicit proving context passed by reference to every proof call.
pub struct ProvingContext {
    backend: Arc<dyn ProofBackend>,
    proofs_generated: AtomicU64,
    proofs_verified: AtomicU64,
    closed: AtomicBool,
}

impl ProvingContext {
    pub fn new(backend: impl ProofBackend + 'static) -> Self {
        log::debug!("proving context initialised with {} backend", backend.name());
        Self {
            backend: Arc::new(backend),
            proofs_generated: AtomicU64::new(0),
            proofs_verified: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Context over a [`Blake3Backend`] derived from `seed`.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self::new(Blake3Backend::from_seed(seed))
    }

    /// Run `f` inside a context that is shut down when `f` returns.
    pub fn session<T>(backend: impl ProofBackend + 'static, f: impl FnOnce(&ProvingContext) -> T) -> T {
        let ctx = Self::new(backend);
        let out = f(&ctx);
        ctx.shutdown();
        out
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Check `witness` against `public_input` and seal the statement.
    pub fn prove<W: Witness>(
        &self,
        public_input: &StateTransition,
        witness: &W,
    ) -> Result<Seal, ProofError> {
        self.ensure_open()?;
        witness.synthesize(public_input, self)?;

        let statement = Statement {
            kind: W::KIND,
            public_input: *public_input,
            witness_commitment: witness.commitment(),
            steps: witness.steps(),
        };
        let seal = self.backend.prove(&statement)?;
        self.proofs_generated.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "{:?} proof sealed: {} -> {}",
            W::KIND,
            public_input.source.account_db_commitment,
            public_input.target.account_db_commitment
        );
        Ok(seal)
    }

    /// Check a seal against its statement. Read-only; safe to call concurrently.
    pub fn check(&self, statement: &Statement, seal: &Seal) -> Result<(), ProofError> {
        self.ensure_open()?;
        if !self.backend.verify(statement, seal) {
            return Err(ProofError::VerificationFailed(format!(
                "{:?} seal does not match its statement",
                statement.kind
            )));
        }
        self.proofs_verified.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            backend: self.backend.name().to_string(),
            proofs_generated: self.proofs_generated.load(Ordering::Relaxed),
            proofs_verified: self.proofs_verified.load(Ordering::Relaxed),
            open: self.is_open(),
        }
    }

    /// Release the backend. Later calls fail with [`ProofError::ContextClosed`].
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let stats = self.stats();
            log::info!(
                "proving context shut down: {} generated, {} verified",
                stats.proofs_generated,
                stats.proofs_verified
            );
        }
    }

    fn ensure_open(&self) -> Result<(), ProofError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ProofError::ContextClosed)
        }
    }
}

impl fmt::Debug for ProvingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvingContext")
            .field("backend", &self.backend.name())
            .field("open", &self.is_open())
            .finish()
    }
}
