//! Canonical byte layouts and SHA-256 digests
//!
//! All multi-byte integers are laid out big-endian and fixed-width. The
//! encodings here are bit-exact with the server's accumulator: changing a
//! single byte anywhere breaks interop, so every layout is pinned by tests.

use sha2::{Digest as _, Sha256};

/// Length in bytes of every digest in the protocol.
pub const DIGEST_LEN: usize = 32;

/// A raw SHA-256 digest.
pub type Digest = [u8; DIGEST_LEN];

/// Domain-separation prefix for Merkle leaves.
pub const LEAF_PREFIX: u8 = 0x00;

/// Domain-separation prefix for interior Merkle nodes.
pub const NODE_PREFIX: u8 = 0x01;

/// Domain prefix for plain stored values.
pub const PLAIN_VALUE_PREFIX: u8 = 0x00;

/// Domain prefix for reference (alias) stored values.
pub const REFERENCE_VALUE_PREFIX: u8 = 0x01;

/// SHA-256 of a single byte string.
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over the concatenation of the given slices.
pub fn sha256_concat(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Digest of an interior Merkle node: `SHA256(0x01 ‖ left ‖ right)`.
pub fn node_digest(left: &Digest, right: &Digest) -> Digest {
    sha256_concat(&[&[NODE_PREFIX], left, right])
}

/// Digest of an accumulator leaf: `SHA256(0x00 ‖ leaf)`.
pub fn leaf_digest(leaf: &[u8]) -> Digest {
    sha256_concat(&[&[LEAF_PREFIX], leaf])
}

/// Stored byte layout of a plain value: `0x00 ‖ value`.
pub fn encode_plain_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + value.len());
    out.push(PLAIN_VALUE_PREFIX);
    out.extend_from_slice(value);
    out
}

/// Stored byte layout of a reference value: `0x01 ‖ atTx(8) ‖ targetKey`.
///
/// `at_tx == 0` marks an unbound reference that always resolves to the
/// target key's latest revision.
pub fn encode_reference_value(target_key: &[u8], at_tx: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + target_key.len());
    out.push(REFERENCE_VALUE_PREFIX);
    out.extend_from_slice(&at_tx.to_be_bytes());
    out.extend_from_slice(target_key);
    out
}

/// Canonical key of a sorted-set member:
/// `set ‖ keyLen(8) ‖ key ‖ score(8, IEEE-754 BE) ‖ atTx(8)`.
pub fn encode_zset_key(set: &[u8], key: &[u8], score: f64, at_tx: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(set.len() + 8 + key.len() + 8 + 8);
    out.extend_from_slice(set);
    out.extend_from_slice(&(key.len() as u64).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&score.to_bits().to_be_bytes());
    out.extend_from_slice(&at_tx.to_be_bytes());
    out
}

/// Digest of a stored value, as recorded in a transaction entry.
pub fn value_digest(encoded_value: &[u8]) -> Digest {
    sha256(encoded_value)
}

/// Per-entry digest used as a Merkle leaf of the per-transaction tree:
/// `SHA256(0x00 ‖ encodedKey ‖ hValue')`.
///
/// For version 1 entries carrying metadata, `hValue'` folds the metadata in:
/// `SHA256(metadataBytes ‖ valueLen(4) ‖ hValue)`. Version 0 and metadata-less
/// version 1 entries use `hValue` as-is.
pub fn entry_digest(
    encoded_key: &[u8],
    h_value: &Digest,
    v_len: u32,
    metadata: Option<&[u8]>,
    version: i32,
) -> crate::Result<Digest> {
    let folded = match version {
        0 => *h_value,
        1 => match metadata {
            Some(md) if !md.is_empty() => {
                sha256_concat(&[md, &v_len.to_be_bytes(), h_value])
            }
            _ => *h_value,
        },
        v => return Err(crate::VerifyError::UnsupportedVersion(v)),
    };
    Ok(sha256_concat(&[&[LEAF_PREFIX], encoded_key, &folded]))
}
