//! Cryptographic verification core for the veridb transaction log
//!
//! This crate implements the canonical digest encodings, the per-transaction
//! entry tree, the binary-linked accumulator over committed transactions, and
//! the proof verifiers the client driver runs before trusting any server
//! response. Everything here is pure and synchronous; the async driver in the
//! root crate sequences RPCs and feeds responses into these functions.

use thiserror::Error;

pub mod ahtree;
pub mod digest;
pub mod htree;
pub mod proofs;
pub mod schema;
pub mod state;

pub use digest::{Digest, DIGEST_LEN};
pub use proofs::{DualProof, InclusionProof, LinearProof};
pub use schema::{Entry, EntryMetadata, Reference, Tx, TxEntry, TxHeader, ZEntry};
pub use state::TrustedState;

/// Verification error types. Every variant names the specific sub-check that
/// rejected the proof; the driver wraps these into its `VerificationFailed`
/// error kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("unsupported transaction header version: {0}")]
    UnsupportedVersion(i32),

    #[error("inclusion proof does not bind the entry digest to the tree root")]
    Inclusion,

    #[error("last-leaf inclusion proof does not cover the latest accumulator leaf")]
    LastInclusion,

    #[error("consistency proof does not link the accumulator roots")]
    Consistency,

    #[error("linear proof chain does not reach the target hash")]
    Linear,

    #[error("proof header mismatch: {0}")]
    HeaderMismatch(&'static str),

    #[error("trusted hash differs from the server's for the same transaction")]
    AnchorMismatch,

    #[error("entry binding violated: {0}")]
    Binding(&'static str),

    #[error("malformed proof: {0}")]
    Malformed(&'static str),

    #[error("state signature rejected")]
    Signature,
}

pub type Result<T> = std::result::Result<T, VerifyError>;
