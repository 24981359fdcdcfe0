//! Binary-linked tree over committed transactions
//!
//! Append-only, left-balanced Merkle accumulator whose leaves are the `alh`
//! values of committed transactions, in commit order. Positions are 1-based:
//! the leaf for transaction `i` sits at position `i`. The server maintains
//! this tree; the client only ever verifies inclusion and consistency against
//! roots carried inside transaction headers. The builder half exists so a log
//! can be reconstructed locally, which is how the proof verifiers are
//! exercised against an honest producer.

use crate::digest::{leaf_digest, Digest};
use crate::htree::{audit_path, fold_path, split_point, subtree_root};
use crate::{Result, VerifyError};

/// Append-only accumulator over transaction `alh` values.
#[derive(Debug, Clone, Default)]
pub struct AhTree {
    leaves: Vec<Digest>,
}

impl AhTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the `alh` of the next committed transaction; returns the new
    /// number of leaves.
    pub fn append(&mut self, alh: &Digest) -> u64 {
        self.leaves.push(leaf_digest(alh));
        self.leaves.len() as u64
    }

    pub fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Root over the first `n` leaves.
    pub fn root_at(&self, n: u64) -> Result<Digest> {
        if n == 0 || n > self.size() {
            return Err(VerifyError::Malformed("accumulator size out of range"));
        }
        Ok(subtree_root(&self.leaves[..n as usize]))
    }

    /// Inclusion proof for the leaf at 1-based position `i` within the tree
    /// over the first `n` leaves.
    pub fn inclusion_proof(&self, i: u64, n: u64) -> Result<Vec<Digest>> {
        if i == 0 || i > n || n > self.size() {
            return Err(VerifyError::Malformed("leaf position out of range"));
        }
        Ok(audit_path((i - 1) as usize, &self.leaves[..n as usize]))
    }

    /// Consistency proof between the trees over the first `m` and first `n`
    /// leaves, `0 < m <= n`.
    pub fn consistency_proof(&self, m: u64, n: u64) -> Result<Vec<Digest>> {
        if m == 0 || m > n || n > self.size() {
            return Err(VerifyError::Malformed("consistency bounds out of range"));
        }
        let mut terms = Vec::new();
        if m < n {
            subproof(m as usize, &self.leaves[..n as usize], true, &mut terms);
        }
        Ok(terms)
    }
}

fn subproof(m: usize, leaves: &[Digest], flag: bool, out: &mut Vec<Digest>) {
    let n = leaves.len();
    if m == n {
        if !flag {
            out.push(subtree_root(leaves));
        }
        return;
    }
    let k = split_point(n);
    if m <= k {
        subproof(m, &leaves[..k], flag, out);
        out.push(subtree_root(&leaves[k..]));
    } else {
        subproof(m - k, &leaves[k..], false, out);
        out.push(subtree_root(&leaves[..k]));
    }
}

/// Verifies inclusion of `alh` at 1-based position `i` in the accumulator of
/// size `n` with the given `root`.
pub fn verify_inclusion(terms: &[Digest], i: u64, n: u64, alh: &Digest, root: &Digest) -> bool {
    if i == 0 || i > n {
        return false;
    }
    match fold_path(terms, i - 1, n - 1, &leaf_digest(alh)) {
        Some(acc) => acc == *root,
        None => false,
    }
}

/// Verifies inclusion of the latest leaf: `alh` at position `n` of size `n`.
pub fn verify_last_inclusion(terms: &[Digest], n: u64, alh: &Digest, root: &Digest) -> bool {
    verify_inclusion(terms, n, n, alh, root)
}

/// Verifies that the tree of size `n` with `new_root` is an append-only
/// extension of the tree of size `m` with `old_root` (RFC 6962 consistency).
pub fn verify_consistency(
    terms: &[Digest],
    m: u64,
    n: u64,
    old_root: &Digest,
    new_root: &Digest,
) -> bool {
    if m == 0 || m > n {
        return false;
    }
    if m == n {
        return terms.is_empty() && old_root == new_root;
    }

    let mut path = Vec::with_capacity(terms.len() + 1);
    if m.is_power_of_two() {
        path.push(*old_root);
    }
    path.extend_from_slice(terms);
    if path.len() < 2 {
        return false;
    }

    let mut fnode = m - 1;
    let mut snode = n - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = path[0];
    let mut sr = path[0];
    for term in &path[1..] {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = crate::digest::node_digest(term, &fr);
            sr = crate::digest::node_digest(term, &sr);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            sr = crate::digest::node_digest(&sr, term);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    snode == 0 && fr == *old_root && sr == *new_root
}
