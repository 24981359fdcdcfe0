//! Transport seam and wire message shapes
//!
//! The driver is transport-agnostic: anything that can deliver these message
//! shapes (a generated gRPC stub, an in-process fake, a proxy) implements
//! [`Transport`]. Every reply carries the server's deployment UUID from the
//! response headers so the driver can detect a swapped deployment before
//! trusting anything in the body.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use veridb_verify::{
    Digest, DualProof, Entry, EntryMetadata, InclusionProof, Tx, TxHeader, ZEntry,
};

/// Status of a failed RPC, mirroring gRPC status codes where available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Internal,
    Unknown,
}

/// A failed RPC, with the original code and message preserved.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub code: TransportCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Per-call metadata: the session token goes into the `authorization`
/// header, the deadline bounds the round-trip.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub token: Option<String>,
    pub deadline: Option<Duration>,
}

/// A response body together with the deployment UUID from its headers.
#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub server_uuid: Option<String>,
    pub body: T,
}

impl<T> Reply<T> {
    pub fn new(server_uuid: impl Into<String>, body: T) -> Self {
        Self {
            server_uuid: Some(server_uuid.into()),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub token: String,
    pub server_uuid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: Vec<u8>,
    /// Resolve at this exact transaction; 0 means latest.
    pub at_tx: u64,
    /// Wait until at least this transaction is indexed; 0 disables.
    pub since_tx: u64,
    /// Resolve a specific revision; 0 means latest, negative counts back.
    pub at_revision: i64,
    pub no_wait: bool,
}

impl KeyRequest {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn at_tx(key: impl Into<Vec<u8>>, at_tx: u64) -> Self {
        Self {
            key: key.into(),
            at_tx,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableGetRequest {
    pub key_request: KeyRequest,
    pub prove_since_tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub metadata: Option<EntryMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRequest {
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableSetRequest {
    pub set_request: SetRequest,
    pub prove_since_tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRequest {
    pub key: Vec<u8>,
    pub referenced_key: Vec<u8>,
    /// Pin the reference to this transaction; 0 tracks the latest revision.
    pub at_tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableReferenceRequest {
    pub reference_request: ReferenceRequest,
    pub prove_since_tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZAddRequest {
    pub set: Vec<u8>,
    pub key: Vec<u8>,
    pub score: f64,
    /// Bind the member to this transaction; 0 tracks the latest revision.
    pub at_tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableZAddRequest {
    pub zadd_request: ZAddRequest,
    pub prove_since_tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRequest {
    pub prefix: Vec<u8>,
    pub seek_key: Vec<u8>,
    pub limit: u64,
    pub desc: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZScanRequest {
    pub set: Vec<u8>,
    pub limit: u64,
    pub reverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub key: Vec<u8>,
    pub offset: u64,
    pub limit: u64,
    pub desc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRequest {
    pub tx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableTxRequest {
    pub tx: u64,
    pub prove_since_tx: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxScanRequest {
    pub initial_tx: u64,
    pub limit: u64,
    pub desc: bool,
}

/// A transaction with the proofs required to verify it against prior trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableTx {
    pub tx: Tx,
    pub dual_proof: DualProof,
    /// Server signature over the target state, when signing is configured.
    pub signature: Vec<u8>,
}

/// A resolved entry with its transaction proofs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiableEntry {
    pub entry: Entry,
    pub verifiable_tx: VerifiableTx,
    pub inclusion_proof: InclusionProof,
}

/// The server's current state for one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    pub db: String,
    pub tx_id: u64,
    pub tx_hash: Digest,
    pub signature: Vec<u8>,
}

/// RPC surface the driver depends on.
///
/// Method-per-RPC, mirroring the server's service definition; implementations
/// attach `ctx.token` as the `authorization` header and honor `ctx.deadline`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(
        &self,
        ctx: &CallContext,
        req: OpenSessionRequest,
    ) -> TransportResult<Reply<OpenSessionResponse>>;

    async fn close_session(&self, ctx: &CallContext) -> TransportResult<Reply<()>>;

    async fn keep_alive(&self, ctx: &CallContext) -> TransportResult<Reply<()>>;

    async fn health_check(&self, ctx: &CallContext) -> TransportResult<Reply<bool>>;

    async fn current_state(&self, ctx: &CallContext) -> TransportResult<Reply<ServerState>>;

    async fn get(&self, ctx: &CallContext, req: KeyRequest) -> TransportResult<Reply<Entry>>;

    async fn get_all(
        &self,
        ctx: &CallContext,
        keys: Vec<Vec<u8>>,
    ) -> TransportResult<Reply<Vec<Entry>>>;

    async fn verifiable_get(
        &self,
        ctx: &CallContext,
        req: VerifiableGetRequest,
    ) -> TransportResult<Reply<VerifiableEntry>>;

    async fn set(&self, ctx: &CallContext, req: SetRequest) -> TransportResult<Reply<TxHeader>>;

    async fn verifiable_set(
        &self,
        ctx: &CallContext,
        req: VerifiableSetRequest,
    ) -> TransportResult<Reply<VerifiableTx>>;

    async fn delete(&self, ctx: &CallContext, req: DeleteRequest)
        -> TransportResult<Reply<TxHeader>>;

    async fn set_reference(
        &self,
        ctx: &CallContext,
        req: ReferenceRequest,
    ) -> TransportResult<Reply<TxHeader>>;

    async fn verifiable_set_reference(
        &self,
        ctx: &CallContext,
        req: VerifiableReferenceRequest,
    ) -> TransportResult<Reply<VerifiableTx>>;

    async fn zadd(&self, ctx: &CallContext, req: ZAddRequest) -> TransportResult<Reply<TxHeader>>;

    async fn verifiable_zadd(
        &self,
        ctx: &CallContext,
        req: VerifiableZAddRequest,
    ) -> TransportResult<Reply<VerifiableTx>>;

    async fn scan(&self, ctx: &CallContext, req: ScanRequest)
        -> TransportResult<Reply<Vec<Entry>>>;

    async fn zscan(
        &self,
        ctx: &CallContext,
        req: ZScanRequest,
    ) -> TransportResult<Reply<Vec<ZEntry>>>;

    async fn history(
        &self,
        ctx: &CallContext,
        req: HistoryRequest,
    ) -> TransportResult<Reply<Vec<Entry>>>;

    async fn tx_by_id(&self, ctx: &CallContext, req: TxRequest) -> TransportResult<Reply<Tx>>;

    async fn verifiable_tx_by_id(
        &self,
        ctx: &CallContext,
        req: VerifiableTxRequest,
    ) -> TransportResult<Reply<VerifiableTx>>;

    async fn tx_scan(
        &self,
        ctx: &CallContext,
        req: TxScanRequest,
    ) -> TransportResult<Reply<Vec<Tx>>>;
}
