//! Async client driver for a cryptographically-verifiable append-only
//! key/value database
//!
//! The driver sequences RPCs against any [`transport::Transport`]
//! implementation, runs the proof verifiers from `veridb-verify` over every
//! verifiable response, and only then advances its persisted trust anchor.
//! A verification failure aborts the operation and leaves the anchor
//! untouched.

use thiserror::Error;

pub mod client;
pub mod config;
pub mod pool;
pub mod session;
pub mod state;
pub mod transport;

pub use client::LedgerClient;
pub use config::ClientOptions;
pub use pool::{ConnectParams, Connection, ConnectionFactory, ConnectionPool, PoolOptions};
pub use session::Session;
pub use state::{FileStateStore, MemoryStateStore, StateHolder, StateStore};
pub use transport::{CallContext, Transport, TransportCode, TransportError};
pub use veridb_verify::{
    Entry, EntryMetadata, Reference, TrustedState, Tx, TxHeader, VerifyError, ZEntry,
};

/// Driver error types.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no session is open")]
    NotOpen,

    #[error("a session is already open")]
    AlreadyOpen,

    #[error("key not found")]
    KeyNotFound,

    #[error("transaction not found")]
    TxNotFound,

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("verification failed: {0}")]
    VerificationFailed(#[from] VerifyError),

    #[error("server deployment changed: expected {expected}, got {actual}")]
    DeploymentMismatch { expected: String, actual: String },

    #[error("connection has been released")]
    ConnectionReleased,

    #[error("transport failure ({code:?}): {message}")]
    Transport {
        code: TransportCode,
        message: String,
    },

    #[error("state persistence failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Central mapping from transport failures to driver errors.
///
/// Structured codes win; the substring fallback only catches servers that
/// report lookup misses as plain messages.
pub(crate) fn map_transport_error(err: TransportError) -> ClientError {
    match err.code {
        TransportCode::NotFound => {
            if err.message.contains("tx not found") {
                ClientError::TxNotFound
            } else {
                ClientError::KeyNotFound
            }
        }
        _ => {
            if err.message.contains("key not found") {
                ClientError::KeyNotFound
            } else if err.message.contains("tx not found") {
                ClientError::TxNotFound
            } else {
                ClientError::Transport {
                    code: err.code,
                    message: err.message,
                }
            }
        }
    }
}
