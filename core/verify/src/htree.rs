//! Per-transaction entry tree
//!
//! Left-balanced Merkle tree (RFC 6962 shape: split at the largest power of
//! two below the width) over the already-prefixed entry digests of a single
//! transaction. The root is the header's `eh`. The driver rebuilds this tree
//! from returned entries to prove its own writes, so proof generation lives
//! here next to verification.

use crate::digest::{node_digest, Digest};
use crate::proofs::InclusionProof;
use crate::{Result, VerifyError};

/// Largest power of two strictly below `n`. Caller guarantees `n > 1`.
pub(crate) fn split_point(n: usize) -> usize {
    let mut k = 1usize;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

/// Root over a non-empty slice of leaf digests.
pub(crate) fn subtree_root(leaves: &[Digest]) -> Digest {
    if leaves.len() == 1 {
        return leaves[0];
    }
    let k = split_point(leaves.len());
    node_digest(&subtree_root(&leaves[..k]), &subtree_root(&leaves[k..]))
}

/// Audit path for leaf `m` of a non-empty slice, bottom-up.
pub(crate) fn audit_path(m: usize, leaves: &[Digest]) -> Vec<Digest> {
    if leaves.len() == 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if m < k {
        let mut path = audit_path(m, &leaves[..k]);
        path.push(subtree_root(&leaves[k..]));
        path
    } else {
        let mut path = audit_path(m - k, &leaves[k..]);
        path.push(subtree_root(&leaves[..k]));
        path
    }
}

/// Folds an audit path bottom-up from the leaf at index `fnode` in a tree
/// whose last leaf index is `snode`. Returns the reconstructed root, or
/// `None` when the path length disagrees with the declared indices.
pub(crate) fn fold_path(
    terms: &[Digest],
    mut fnode: u64,
    mut snode: u64,
    leaf: &Digest,
) -> Option<Digest> {
    let mut acc = *leaf;
    for term in terms {
        if snode == 0 {
            return None;
        }
        if fnode & 1 == 1 || fnode == snode {
            acc = node_digest(term, &acc);
            if fnode & 1 == 0 {
                // Right-hand edge: skip levels where the subtree stands alone.
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            acc = node_digest(&acc, term);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    if snode == 0 {
        Some(acc)
    } else {
        None
    }
}

/// Merkle tree over a transaction's entry digests.
#[derive(Debug, Clone)]
pub struct HTree {
    leaves: Vec<Digest>,
    root: Digest,
}

impl HTree {
    /// Builds the tree from entry digests; fails on an empty transaction.
    pub fn new(leaves: Vec<Digest>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(VerifyError::Malformed("entry tree without leaves"));
        }
        let root = subtree_root(&leaves);
        Ok(Self { leaves, root })
    }

    pub fn width(&self) -> usize {
        self.leaves.len()
    }

    pub fn root(&self) -> Digest {
        self.root
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn inclusion_proof(&self, index: usize) -> Result<InclusionProof> {
        if index >= self.leaves.len() {
            return Err(VerifyError::Malformed("leaf index beyond tree width"));
        }
        Ok(InclusionProof {
            leaf: index as u64,
            width: self.leaves.len() as u64,
            terms: audit_path(index, &self.leaves),
        })
    }
}

/// Verifies that `leaf_digest` sits at `proof.leaf` in a tree of
/// `proof.width` leaves with the given `root`.
pub fn verify_inclusion(proof: &InclusionProof, leaf_digest: &Digest, root: &Digest) -> bool {
    if proof.width == 0 || proof.leaf >= proof.width {
        return false;
    }
    match fold_path(&proof.terms, proof.leaf, proof.width - 1, leaf_digest) {
        Some(acc) => acc == *root,
        None => false,
    }
}
