//! Proof structures and the linear / dual verifiers
//!
//! A dual proof ties a source transaction to a target transaction through
//! three independent checks: inclusion of the source `alh` in the target's
//! binary-linked tree, consistency between the source's and target's
//! binary-linked roots, and a linear hash chain covering the suffix the tree
//! does not yet contain. All three must hold for the driver to move its
//! trust anchor.

use serde::{Deserialize, Serialize};

use crate::ahtree;
use crate::digest::{sha256_concat, Digest};
use crate::schema::TxHeader;
use crate::{Result, VerifyError};

/// Merkle path for one leaf of a per-transaction entry tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// 0-based leaf index.
    pub leaf: u64,
    /// Number of leaves in the tree.
    pub width: u64,
    pub terms: Vec<Digest>,
}

/// Hash chain from a source transaction to a target transaction.
///
/// `terms[0]` is the source `alh`; each later term is the inner hash of the
/// next transaction header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearProof {
    pub source_tx_id: u64,
    pub target_tx_id: u64,
    pub terms: Vec<Digest>,
}

/// Combined proof that `target_tx_header` legitimately succeeds
/// `source_tx_header` in the same append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualProof {
    pub source_tx_header: TxHeader,
    pub target_tx_header: TxHeader,
    /// Inclusion of the source `alh` in the target's binary-linked tree.
    pub inclusion_proof: Vec<Digest>,
    /// Consistency between source and target binary-linked roots.
    pub consistency_proof: Vec<Digest>,
    /// `alh` of the last transaction covered by the target's binary-linked tree.
    pub target_bl_tx_alh: Digest,
    /// Inclusion of `target_bl_tx_alh` as the latest binary-linked leaf.
    pub last_inclusion_proof: Vec<Digest>,
    pub linear_proof: LinearProof,
}

/// Walks a linear proof from `source_alh` and accepts iff the chain lands
/// exactly on `target_alh`.
pub fn verify_linear(proof: &LinearProof, source_alh: &Digest, target_alh: &Digest) -> Result<()> {
    if proof.source_tx_id == 0 || proof.source_tx_id > proof.target_tx_id {
        return Err(VerifyError::Malformed("linear proof bounds out of order"));
    }
    let expected_len = proof.target_tx_id - proof.source_tx_id + 1;
    if proof.terms.len() as u64 != expected_len {
        return Err(VerifyError::Malformed("linear proof length mismatch"));
    }
    if proof.terms[0] != *source_alh {
        return Err(VerifyError::Linear);
    }

    let mut alh = proof.terms[0];
    for (i, inner) in proof.terms.iter().enumerate().skip(1) {
        let tx_id = proof.source_tx_id + i as u64;
        alh = sha256_concat(&[&tx_id.to_be_bytes(), &alh, inner]);
    }
    if alh == *target_alh {
        Ok(())
    } else {
        Err(VerifyError::Linear)
    }
}

/// Verifies a dual proof for the transition `source_id → target_id` with the
/// given trusted hashes.
///
/// The caller handles the two degenerate anchors itself: `source_id == 0`
/// (no prior trust, nothing to verify) and `source_id == target_id` (equal
/// hashes required, no proof involved). Everything else lands here.
pub fn verify_dual(
    proof: &DualProof,
    source_id: u64,
    target_id: u64,
    source_alh: &Digest,
    target_alh: &Digest,
) -> Result<()> {
    if proof.source_tx_header.id != source_id {
        return Err(VerifyError::HeaderMismatch("source transaction id"));
    }
    if proof.target_tx_header.id != target_id {
        return Err(VerifyError::HeaderMismatch("target transaction id"));
    }
    if source_id >= target_id {
        return Err(VerifyError::Malformed("dual proof bounds out of order"));
    }
    if proof.source_tx_header.alh()? != *source_alh {
        return Err(VerifyError::HeaderMismatch("source header hash"));
    }
    if proof.target_tx_header.alh()? != *target_alh {
        return Err(VerifyError::HeaderMismatch("target header hash"));
    }
    if proof.source_tx_header.bl_tx_id > proof.target_tx_header.bl_tx_id {
        return Err(VerifyError::Malformed("binary-linked tree shrank"));
    }

    let target_bl = proof.target_tx_header.bl_tx_id;

    if source_id < target_bl {
        if !ahtree::verify_inclusion(
            &proof.inclusion_proof,
            source_id,
            target_bl,
            source_alh,
            &proof.target_tx_header.bl_root,
        ) {
            return Err(VerifyError::Inclusion);
        }
        if proof.source_tx_header.bl_tx_id > 0
            && !ahtree::verify_consistency(
                &proof.consistency_proof,
                proof.source_tx_header.bl_tx_id,
                target_bl,
                &proof.source_tx_header.bl_root,
                &proof.target_tx_header.bl_root,
            )
        {
            return Err(VerifyError::Consistency);
        }
    }

    if target_bl > 0
        && !ahtree::verify_last_inclusion(
            &proof.last_inclusion_proof,
            target_bl,
            &proof.target_bl_tx_alh,
            &proof.target_tx_header.bl_root,
        )
    {
        return Err(VerifyError::LastInclusion);
    }

    // The linear walk starts wherever binary-linked coverage ends: from the
    // last tree leaf when the source is already inside the tree, from the
    // source itself otherwise.
    if source_id < target_bl {
        if proof.linear_proof.source_tx_id != target_bl
            || proof.linear_proof.target_tx_id != target_id
        {
            return Err(VerifyError::Malformed("linear proof bounds mismatch"));
        }
        verify_linear(&proof.linear_proof, &proof.target_bl_tx_alh, target_alh)
    } else {
        if proof.linear_proof.source_tx_id != source_id
            || proof.linear_proof.target_tx_id != target_id
        {
            return Err(VerifyError::Malformed("linear proof bounds mismatch"));
        }
        verify_linear(&proof.linear_proof, source_alh, target_alh)
    }
}
