//! Last-trusted database state
//!
//! The driver persists one `TrustedState` per `(deployment, database)` and
//! only replaces it after a full proof verification. Servers configured with
//! a signing key additionally sign `(db ‖ txId ‖ txHash)` with ECDSA over
//! secp256r1; the signature travels with the state so an offline copy stays
//! attributable.

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::{Result, VerifyError};

/// The client's trust anchor for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedState {
    pub db: String,
    pub tx_id: u64,
    /// `alh` of the transaction header at `tx_id`.
    pub tx_hash: Digest,
    /// DER-encoded ECDSA signature over [`TrustedState::signed_payload`];
    /// empty when the server does not sign states.
    pub signature: Vec<u8>,
}

impl TrustedState {
    pub fn new(db: impl Into<String>, tx_id: u64, tx_hash: Digest, signature: Vec<u8>) -> Self {
        Self {
            db: db.into(),
            tx_id,
            tx_hash,
            signature,
        }
    }

    /// Byte string the server signs: `db ‖ txId(8) ‖ txHash`.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.db.len() + 8 + self.tx_hash.len());
        out.extend_from_slice(self.db.as_bytes());
        out.extend_from_slice(&self.tx_id.to_be_bytes());
        out.extend_from_slice(&self.tx_hash);
        out
    }

    /// Checks the state signature against the server's public key.
    ///
    /// Any parse failure of the DER signature rejects; a missing signature
    /// rejects as well, since the caller only asks when a key is configured.
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        let signature =
            Signature::from_der(&self.signature).map_err(|_| VerifyError::Signature)?;
        key.verify(&self.signed_payload(), &signature)
            .map_err(|_| VerifyError::Signature)
    }
}

/// Parses a SEC1-encoded secp256r1 public key.
pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(bytes).map_err(|_| VerifyError::Signature)
}
