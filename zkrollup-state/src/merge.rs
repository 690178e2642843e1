//! Recursive proof composition.
//!
//! Two proofs of adjacent transitions fold into one proof of the combined
//! transition. A sequence of N proofs settles in `ceil(log2 N)` rounds of
//! pairwise merges.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::backend::ProvingContext;
use crate::circuit::MergeWitness;
use crate::error::{ProofError, Result, ValidationError};
use crate::proof::{Proof, TransitionProof};
use crate::types::StateTransition;

/// Fold `left` and `right` into a proof of `(left.source, right.target)`.
pub fn merge(
    ctx: &ProvingContext,
    left: &TransitionProof,
    right: &TransitionProof,
) -> Result<TransitionProof> {
    let (l, r) = (left.public_input(), right.public_input());
    if !l.chains_into(&r) {
        return Err(ValidationError::ChainMismatch {
            left_target: l.target,
            right_source: r.source,
        }
        .into());
    }

    let witness = MergeWitness {
        left: left.digest(),
        right: right.digest(),
    };
    let proof = Proof::create(ctx, StateTransition::new(l.source, r.target), witness)?;
    Ok(TransitionProof::Merge(proof))
}

/// Fold an ordered sequence of adjacent proofs into a single proof.
///
/// Every input seal is checked first, so a lone proof is never passed
/// through unverified.
pub fn settle(ctx: &ProvingContext, proofs: Vec<TransitionProof>) -> Result<TransitionProof> {
    if proofs.is_empty() {
        return Err(ValidationError::EmptySettlement.into());
    }
    verify_all(ctx, &proofs)?;

    let count = proofs.len();
    let mut layer = proofs;
    let mut rounds = 0usize;
    while layer.len() > 1 {
        layer = merge_round(ctx, layer)?;
        rounds += 1;
        log::debug!("merge round {} left {} proofs", rounds, layer.len());
    }

    let settled = layer.pop().ok_or(ValidationError::EmptySettlement)?;
    let transition = settled.public_input();
    log::info!(
        "settled {} proofs ({} steps) in {} rounds: {} -> {}",
        count,
        settled.steps(),
        rounds,
        transition.source.account_db_commitment,
        transition.target.account_db_commitment
    );
    Ok(settled)
}

/// Check every proof's seal. Proofs are independent, so this runs in parallel.
pub fn verify_all(ctx: &ProvingContext, proofs: &[TransitionProof]) -> Result<(), ProofError> {
    #[cfg(feature = "parallel")]
    {
        proofs.par_iter().try_for_each(|proof| proof.verify(ctx))
    }

    #[cfg(not(feature = "parallel"))]
    {
        proofs.iter().try_for_each(|proof| proof.verify(ctx))
    }
}

fn merge_round(ctx: &ProvingContext, layer: Vec<TransitionProof>) -> Result<Vec<TransitionProof>> {
    #[cfg(feature = "parallel")]
    {
        layer.par_chunks(2).map(|pair| fold_pair(ctx, pair)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        layer.chunks(2).map(|pair| fold_pair(ctx, pair)).collect()
    }
}

fn fold_pair(ctx: &ProvingContext, pair: &[TransitionProof]) -> Result<TransitionProof> {
    match pair {
        [left, right] => merge(ctx, left, right),
        // Odd element carries over to the next round
        [single] => Ok(single.clone()),
        _ => Err(ValidationError::EmptySettlement.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollupError;
    use crate::keys::PublicKey;
    use crate::types::Deposit;
    use crate::{process_deposit, AccountDb, PendingDepositStack};

    fn deposits(ctx: &ProvingContext, n: u8) -> Vec<TransitionProof> {
        let mut queue = PendingDepositStack::new();
        let mut db = AccountDb::new(32).unwrap();
        for b in 1..=n {
            queue.push(Deposit::new(PublicKey::from_bytes([b; 32]), b as u64));
        }
        (0..n)
            .map(|_| process_deposit(ctx, &mut queue, &mut db).unwrap())
            .collect()
    }

    #[test]
    fn merge_spans_both_children() {
        let ctx = ProvingContext::from_seed(b"merge");
        let proofs = deposits(&ctx, 2);
        let merged = merge(&ctx, &proofs[0], &proofs[1]).unwrap();

        assert_eq!(merged.public_input().source, proofs[0].public_input().source);
        assert_eq!(merged.public_input().target, proofs[1].public_input().target);
        assert_eq!(merged.steps(), 2);
        assert!(merged.verify(&ctx).is_ok());
    }

    #[test]
    fn merge_rejects_non_adjacent_proofs() {
        let ctx = ProvingContext::from_seed(b"merge");
        let proofs = deposits(&ctx, 2);
        let err = merge(&ctx, &proofs[1], &proofs[0]).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Validation(ValidationError::ChainMismatch { .. })
        ));
    }

    #[test]
    fn merge_rejects_children_sealed_elsewhere() {
        let ctx = ProvingContext::from_seed(b"merge");
        let foreign = ProvingContext::from_seed(b"foreign");
        let proofs = deposits(&foreign, 2);
        let err = merge(&ctx, &proofs[0], &proofs[1]).unwrap_err();
        assert!(matches!(err, RollupError::Proof(ProofError::ConstraintViolation(_))));
    }

    #[test]
    fn settle_handles_odd_counts() {
        let ctx = ProvingContext::from_seed(b"merge");
        let proofs = deposits(&ctx, 5);
        let first = proofs[0].public_input().source;
        let last = proofs[4].public_input().target;

        let settled = settle(&ctx, proofs).unwrap();
        assert_eq!(settled.public_input(), StateTransition::new(first, last));
        assert_eq!(settled.steps(), 5);
    }

    #[test]
    fn settle_checks_a_lone_proof() {
        let ctx = ProvingContext::from_seed(b"merge");
        let foreign = deposits(&ProvingContext::from_seed(b"foreign"), 1);

        let err = settle(&ctx, foreign).unwrap_err();
        assert!(matches!(err, RollupError::Proof(ProofError::VerificationFailed(_))));

        let own = deposits(&ctx, 1);
        assert_eq!(settle(&ctx, own.clone()).unwrap(), own[0]);
        assert_eq!(ctx.stats().proofs_verified, 1);
    }

    #[test]
    fn settle_rejects_a_tampered_input() {
        let ctx = ProvingContext::from_seed(b"merge");
        let mut proofs = deposits(&ctx, 3);
        if let TransitionProof::Deposit(p) = &mut proofs[2] {
            p.steps = 2;
        }

        assert!(matches!(
            settle(&ctx, proofs).unwrap_err(),
            RollupError::Proof(ProofError::VerificationFailed(_))
        ));
    }

    #[test]
    fn settle_rejects_empty_input() {
        let ctx = ProvingContext::from_seed(b"merge");
        assert_eq!(
            settle(&ctx, Vec::new()).unwrap_err(),
            RollupError::Validation(ValidationError::EmptySettlement)
        );
    }

    #[test]
    fn verify_all_reports_the_bad_proof() {
        let ctx = ProvingContext::from_seed(b"merge");
        let mut proofs = deposits(&ctx, 3);
        assert!(verify_all(&ctx, &proofs).is_ok());

        if let TransitionProof::Deposit(p) = &mut proofs[1] {
            p.steps = 2;
        }
        assert!(verify_all(&ctx, &proofs).is_err());
    }
}
