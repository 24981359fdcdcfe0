//! Typed data model of the transaction log
//!
//! Mirrors the wire shapes the server returns. Header digests (`alh`) and
//! entry digests are computed here so the driver never trusts a digest it did
//! not derive itself.

use serde::{Deserialize, Serialize};

use crate::digest::{self, Digest};
use crate::htree::HTree;
use crate::proofs::InclusionProof;
use crate::{Result, VerifyError};

/// Attribute code marking an entry as logically deleted.
const META_DELETED: u8 = 0x00;
/// Attribute code carrying an expiration timestamp (unix seconds, 8 bytes).
const META_EXPIRES_AT: u8 = 0x01;
/// Attribute code excluding the entry from secondary indexing.
const META_NON_INDEXABLE: u8 = 0x02;

/// Flags attached to a stored entry.
///
/// Serialized as attribute records in ascending attribute-code order; the
/// serialized form feeds the entry digest, so the layout is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub deleted: bool,
    pub expires_at: Option<i64>,
    pub non_indexable: bool,
}

impl EntryMetadata {
    /// Canonical attribute-record serialization.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.deleted {
            out.push(META_DELETED);
        }
        if let Some(ts) = self.expires_at {
            out.push(META_EXPIRES_AT);
            out.extend_from_slice(&ts.to_be_bytes());
        }
        if self.non_indexable {
            out.push(META_NON_INDEXABLE);
        }
        out
    }

    /// Parses the canonical attribute-record serialization.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut md = EntryMetadata::default();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                META_DELETED => {
                    md.deleted = true;
                    i += 1;
                }
                META_EXPIRES_AT => {
                    let end = i + 9;
                    if end > bytes.len() {
                        return Err(VerifyError::Malformed("truncated expiration attribute"));
                    }
                    let mut ts = [0u8; 8];
                    ts.copy_from_slice(&bytes[i + 1..end]);
                    md.expires_at = Some(i64::from_be_bytes(ts));
                    i = end;
                }
                META_NON_INDEXABLE => {
                    md.non_indexable = true;
                    i += 1;
                }
                _ => return Err(VerifyError::Malformed("unknown metadata attribute")),
            }
        }
        Ok(md)
    }

    pub fn is_empty(&self) -> bool {
        !self.deleted && self.expires_at.is_none() && !self.non_indexable
    }
}

/// Committed transaction header.
///
/// `alh` chains headers into the linear trust chain:
/// `alh = SHA256(id(8) ‖ prevAlh(32) ‖ innerHash)`, with `innerHash` layout
/// depending on `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHeader {
    pub id: u64,
    pub prev_alh: Digest,
    pub ts: i64,
    pub version: i32,
    /// Raw header metadata bytes; empty means absent.
    pub metadata: Vec<u8>,
    pub nentries: u32,
    /// Merkle root over this transaction's entries.
    pub eh: Digest,
    /// Number of leaves in the binary-linked tree when this tx committed.
    pub bl_tx_id: u64,
    /// Root of the binary-linked tree over the first `bl_tx_id` transactions.
    pub bl_root: Digest,
}

impl TxHeader {
    /// Version-dependent inner hash over the non-chaining header fields.
    pub fn inner_hash(&self) -> Result<Digest> {
        match self.version {
            0 => Ok(digest::sha256_concat(&[
                &self.ts.to_be_bytes(),
                &self.nentries.to_be_bytes(),
                &self.eh,
                &self.bl_tx_id.to_be_bytes(),
                &self.bl_root,
            ])),
            1 => {
                let mut tail = Vec::with_capacity(2 + 2 + self.metadata.len() + 4 + 32);
                tail.extend_from_slice(&(self.version as u16).to_be_bytes());
                if !self.metadata.is_empty() {
                    tail.extend_from_slice(&(self.metadata.len() as u16).to_be_bytes());
                    tail.extend_from_slice(&self.metadata);
                }
                tail.extend_from_slice(&self.nentries.to_be_bytes());
                tail.extend_from_slice(&self.eh);
                let tail_digest = digest::sha256(&tail);
                Ok(digest::sha256_concat(&[
                    &self.ts.to_be_bytes(),
                    &self.bl_tx_id.to_be_bytes(),
                    &self.bl_root,
                    &tail_digest,
                ]))
            }
            v => Err(VerifyError::UnsupportedVersion(v)),
        }
    }

    /// Accumulative linear hash of this header.
    pub fn alh(&self) -> Result<Digest> {
        let inner = self.inner_hash()?;
        Ok(digest::sha256_concat(&[
            &self.id.to_be_bytes(),
            &self.prev_alh,
            &inner,
        ]))
    }
}

/// One entry of a committed transaction, as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntry {
    /// Canonical (encoded) key.
    pub key: Vec<u8>,
    /// Digest of the stored (prefixed) value.
    pub h_value: Digest,
    /// Length in bytes of the stored value.
    pub v_len: u32,
    pub metadata: Option<EntryMetadata>,
}

impl TxEntry {
    /// Merkle leaf digest of this entry under the given header version.
    pub fn digest(&self, version: i32) -> Result<Digest> {
        let md_bytes = self.metadata.as_ref().map(|m| m.to_bytes());
        digest::entry_digest(
            &self.key,
            &self.h_value,
            self.v_len,
            md_bytes.as_deref(),
            version,
        )
    }
}

/// A committed transaction: header plus entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub header: TxHeader,
    pub entries: Vec<TxEntry>,
}

impl Tx {
    /// Rebuilds the per-transaction entry tree from the entries.
    ///
    /// The resulting root must equal `header.eh` for any inclusion proof
    /// produced from it to verify; a server lying about its entries makes
    /// every proof fail.
    pub fn build_entry_tree(&self) -> Result<HTree> {
        if self.entries.is_empty() {
            return Err(VerifyError::Malformed("transaction without entries"));
        }
        let leaves = self
            .entries
            .iter()
            .map(|e| e.digest(self.header.version))
            .collect::<Result<Vec<_>>>()?;
        HTree::new(leaves)
    }

    /// Produces an inclusion proof for the entry with the given encoded key.
    pub fn proof(&self, encoded_key: &[u8]) -> Result<InclusionProof> {
        let index = self
            .entries
            .iter()
            .position(|e| e.key == encoded_key)
            .ok_or(VerifyError::Malformed("key not present in transaction"))?;
        self.build_entry_tree()?.inclusion_proof(index)
    }
}

/// A resolved key/value pair returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Transaction that committed this entry.
    pub tx: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub metadata: Option<EntryMetadata>,
    /// 1-based count of writes to this key up to `tx`.
    pub revision: i64,
    /// Present when the entry was reached through an alias key.
    pub referenced_by: Option<Reference>,
}

/// Alias record describing how an entry was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Transaction that committed the reference itself.
    pub tx: u64,
    /// The alias key.
    pub key: Vec<u8>,
    /// Pinned target transaction; 0 resolves to the latest revision.
    pub at_tx: u64,
    pub metadata: Option<EntryMetadata>,
}

/// A sorted-set member together with its resolved entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZEntry {
    pub set: Vec<u8>,
    pub key: Vec<u8>,
    pub score: f64,
    pub at_tx: u64,
    pub entry: Entry,
}
