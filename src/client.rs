//! Client facade
//!
//! Sequences RPCs, runs the verifiers over every verifiable response, and
//! atomically advances the trusted state. Verified operations serialize
//! behind a per-client mutex: the state snapshot taken at the start and the
//! publish at the end form one critical section, so the anchor's `tx_id`
//! never moves backwards. Plain operations bypass both the mutex and the
//! anchor entirely.

use std::future::Future;
use std::sync::Arc;

use p256::ecdsa::VerifyingKey;

use veridb_verify::digest::{
    encode_plain_value, encode_reference_value, encode_zset_key, entry_digest, value_digest,
};
use veridb_verify::state::parse_public_key;
use veridb_verify::{htree, proofs, Digest};
use veridb_verify::{Entry, TrustedState, Tx, TxHeader, VerifyError, ZEntry};

use crate::config::ClientOptions;
use crate::pool::{Connection, ConnectionFactory, ConnectionPool};
use crate::session::SessionManager;
use crate::state::{FileStateStore, MemoryStateStore, StateHolder, StateStore};
use crate::transport::{
    CallContext, DeleteRequest, HistoryRequest, KeyRequest, KeyValue, Reply, ReferenceRequest,
    ScanRequest, ServerState, SetRequest, Transport, TransportCode, TransportError,
    TransportResult, TxRequest, TxScanRequest, VerifiableGetRequest, VerifiableReferenceRequest,
    VerifiableSetRequest, VerifiableTx, VerifiableTxRequest, VerifiableZAddRequest, ZAddRequest,
    ZScanRequest,
};
use crate::{map_transport_error, ClientError, Result};

/// Driver for one server deployment.
///
/// Cheap to share across tasks behind an `Arc`; holds at most one session.
pub struct LedgerClient {
    options: ClientOptions,
    factory: Arc<dyn ConnectionFactory>,
    pool: Arc<ConnectionPool>,
    sessions: SessionManager,
    state: StateHolder,
    conn: tokio::sync::RwLock<Connection>,
    // Serializes steps snapshot→verify→publish of verified operations.
    verified_lock: tokio::sync::Mutex<()>,
    signing_key: Option<VerifyingKey>,
}

impl LedgerClient {
    /// Builds a client on a pool configured from the options' pool fields.
    pub fn new(options: ClientOptions, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let pool = ConnectionPool::new(options.pool_options());
        Self::with_pool(options, factory, pool)
    }

    /// Builds a client on an explicitly provided pool, such as the
    /// process-wide [`ConnectionPool::global`]. The pool's own options
    /// govern pooling; the pool-related fields of `options` are not
    /// consulted here.
    pub fn with_pool(
        options: ClientOptions,
        factory: Arc<dyn ConnectionFactory>,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self> {
        let signing_key = match &options.server_signing_key {
            Some(bytes) => Some(parse_public_key(bytes)?),
            None => None,
        };
        let store: Box<dyn StateStore> = match &options.state_dir {
            Some(dir) => Box::new(FileStateStore::new(dir.clone())?),
            None => Box::new(MemoryStateStore::new()),
        };
        let state = StateHolder::new(store, &options.server_addr(), options.check_deployment);

        Ok(Self {
            options,
            factory,
            pool,
            sessions: SessionManager::new(),
            state,
            conn: tokio::sync::RwLock::new(Connection::Released),
            verified_lock: tokio::sync::Mutex::new(()),
            signing_key,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Snapshot of the persisted trusted state for `db`, if any verified
    /// operation (or trust bootstrap) has run against it.
    pub fn stored_state(&self, db: &str) -> Result<Option<TrustedState>> {
        self.state.get(db)
    }

    /// Acquires a pooled connection and opens an authenticated session.
    pub async fn open(&self, user: &str, password: &str, database: &str) -> Result<()> {
        {
            let mut conn = self.conn.write().await;
            if conn.is_released() {
                *conn = self
                    .pool
                    .acquire(&self.options.connect_params(), &self.factory)
                    .await?;
            } else {
                return Err(ClientError::AlreadyOpen);
            }
        }

        let transport = self.transport().await?;
        let opened = self
            .sessions
            .open(
                transport,
                user,
                password,
                database,
                self.options.heartbeat_interval,
                self.options.call_timeout,
            )
            .await;

        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                self.release_connection().await;
                return Err(err);
            }
        };

        if let Err(err) = self.state.check_server_uuid(Some(&session.server_uuid)) {
            // Don't leave a half-open session on a deployment we refuse.
            if let Ok(transport) = self.transport().await {
                let _ = self
                    .sessions
                    .close(transport, self.options.call_timeout)
                    .await;
            }
            self.release_connection().await;
            return Err(err);
        }

        Ok(())
    }

    /// Closes the session and returns the connection to the pool.
    pub async fn close(&self) -> Result<()> {
        let transport = match self.transport().await {
            Ok(transport) => transport,
            Err(_) => return Err(ClientError::NotOpen),
        };
        let result = self
            .sessions
            .close(transport, self.options.call_timeout)
            .await;
        self.release_connection().await;
        result
    }

    pub async fn health_check(&self) -> Result<bool> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.health_check(&ctx)).await?;
        self.accept(reply)
    }

    /// The server's current state for the session database, unverified.
    pub async fn current_state(&self) -> Result<ServerState> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.current_state(&ctx)).await?;
        self.accept(reply)
    }

    // ---- plain operations -------------------------------------------------

    pub async fn get(&self, key: impl Into<Vec<u8>>) -> Result<Entry> {
        self.get_req(KeyRequest::new(key.into())).await
    }

    pub async fn get_at(&self, key: impl Into<Vec<u8>>, at_tx: u64) -> Result<Entry> {
        self.get_req(KeyRequest::at_tx(key.into(), at_tx)).await
    }

    pub async fn get_req(&self, req: KeyRequest) -> Result<Entry> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.get(&ctx, req)).await?;
        self.accept(reply)
    }

    pub async fn get_all(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Entry>> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.get_all(&ctx, keys)).await?;
        self.accept(reply)
    }

    pub async fn set(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<TxHeader> {
        self.set_all(vec![KeyValue {
            key: key.into(),
            value: value.into(),
            metadata: None,
        }])
        .await
    }

    pub async fn set_all(&self, kvs: Vec<KeyValue>) -> Result<TxHeader> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.set(&ctx, SetRequest { kvs })).await?;
        self.accept(reply)
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<TxHeader> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self
            .call(transport.delete(&ctx, DeleteRequest { keys: vec![key.into()] }))
            .await?;
        self.accept(reply)
    }

    pub async fn set_reference(
        &self,
        key: impl Into<Vec<u8>>,
        referenced_key: impl Into<Vec<u8>>,
        at_tx: u64,
    ) -> Result<TxHeader> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let req = ReferenceRequest {
            key: key.into(),
            referenced_key: referenced_key.into(),
            at_tx,
        };
        let reply = self.call(transport.set_reference(&ctx, req)).await?;
        self.accept(reply)
    }

    pub async fn zadd(
        &self,
        set: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
        score: f64,
    ) -> Result<TxHeader> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let req = ZAddRequest {
            set: set.into(),
            key: key.into(),
            score,
            at_tx: 0,
        };
        let reply = self.call(transport.zadd(&ctx, req)).await?;
        self.accept(reply)
    }

    pub async fn scan(&self, req: ScanRequest) -> Result<Vec<Entry>> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.scan(&ctx, req)).await?;
        self.accept(reply)
    }

    pub async fn zscan(&self, req: ZScanRequest) -> Result<Vec<ZEntry>> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.zscan(&ctx, req)).await?;
        self.accept(reply)
    }

    pub async fn history(&self, req: HistoryRequest) -> Result<Vec<Entry>> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.history(&ctx, req)).await?;
        self.accept(reply)
    }

    pub async fn tx_by_id(&self, tx: u64) -> Result<Tx> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.tx_by_id(&ctx, TxRequest { tx })).await?;
        self.accept(reply)
    }

    pub async fn tx_scan(&self, req: TxScanRequest) -> Result<Vec<Tx>> {
        let ctx = self.ctx()?;
        let transport = self.transport().await?;
        let reply = self.call(transport.tx_scan(&ctx, req)).await?;
        self.accept(reply)
    }

    // ---- verified operations ----------------------------------------------

    pub async fn verified_get(&self, key: impl Into<Vec<u8>>) -> Result<Entry> {
        self.verified_get_req(KeyRequest::new(key.into())).await
    }

    pub async fn verified_get_at(&self, key: impl Into<Vec<u8>>, at_tx: u64) -> Result<Entry> {
        self.verified_get_req(KeyRequest::at_tx(key.into(), at_tx)).await
    }

    /// Verified read: proves inclusion of the returned entry in its
    /// transaction and that transaction's membership in the trusted log.
    pub async fn verified_get_req(&self, req: KeyRequest) -> Result<Entry> {
        let _guard = self.verified_lock.lock().await;
        let ctx = self.ctx()?;
        let db = self.session_db()?;
        let state = self.trusted_state(&ctx, &db).await?;

        let transport = self.transport().await?;
        let vreq = VerifiableGetRequest {
            key_request: req.clone(),
            prove_since_tx: state.tx_id,
        };
        let reply = self.call(transport.verifiable_get(&ctx, vreq)).await?;
        let ventry = self.accept(reply)?;
        let entry = ventry.entry;

        if entry.metadata.as_ref().is_some_and(|m| m.deleted) {
            return Err(VerifyError::Binding("entry is marked deleted").into());
        }

        // The proven leaf is the alias entry when the read went through a
        // reference, the entry itself otherwise.
        let (proven_tx, encoded_key, encoded_value, leaf_metadata) = match &entry.referenced_by {
            None => {
                if entry.key != req.key {
                    return Err(VerifyError::Binding("returned key differs from request").into());
                }
                (
                    entry.tx,
                    entry.key.clone(),
                    encode_plain_value(&entry.value),
                    entry.metadata.clone(),
                )
            }
            Some(reference) => {
                if reference.key != req.key {
                    return Err(VerifyError::Binding("alias key differs from request").into());
                }
                (
                    reference.tx,
                    reference.key.clone(),
                    encode_reference_value(&entry.key, reference.at_tx),
                    reference.metadata.clone(),
                )
            }
        };
        if req.at_tx != 0 && proven_tx != req.at_tx {
            return Err(VerifyError::Binding("entry bound to a different transaction").into());
        }

        let dual = &ventry.verifiable_tx.dual_proof;
        let anchor = resolve_anchor(&state, proven_tx, dual)?;

        let md_bytes = leaf_metadata.map(|m| m.to_bytes());
        let leaf = entry_digest(
            &encoded_key,
            &value_digest(&encoded_value),
            encoded_value.len() as u32,
            md_bytes.as_deref(),
            anchor.proven_header_version,
        )?;
        if !htree::verify_inclusion(&ventry.inclusion_proof, &leaf, &anchor.eh) {
            return Err(VerifyError::Inclusion.into());
        }

        self.check_dual(&state, &anchor, dual)?;
        self.publish(&db, &anchor, ventry.verifiable_tx.signature)?;
        Ok(entry)
    }

    /// Verified write of a single key/value pair.
    pub async fn verified_set(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<TxHeader> {
        let key = key.into();
        let value = value.into();
        let encoded_value = encode_plain_value(&value);
        self.verified_write(key.clone(), encoded_value, move |transport, ctx, since| {
            let req = VerifiableSetRequest {
                set_request: SetRequest {
                    kvs: vec![KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        metadata: None,
                    }],
                },
                prove_since_tx: since,
            };
            async move { transport.verifiable_set(&ctx, req).await }
        })
        .await
    }

    /// Verified write of an alias pointing at `referenced_key`.
    pub async fn verified_set_reference(
        &self,
        key: impl Into<Vec<u8>>,
        referenced_key: impl Into<Vec<u8>>,
        at_tx: u64,
    ) -> Result<TxHeader> {
        let key = key.into();
        let referenced_key = referenced_key.into();
        let encoded_value = encode_reference_value(&referenced_key, at_tx);
        self.verified_write(key.clone(), encoded_value, move |transport, ctx, since| {
            let req = VerifiableReferenceRequest {
                reference_request: ReferenceRequest {
                    key: key.clone(),
                    referenced_key: referenced_key.clone(),
                    at_tx,
                },
                prove_since_tx: since,
            };
            async move { transport.verifiable_set_reference(&ctx, req).await }
        })
        .await
    }

    /// Verified insertion of a sorted-set member.
    pub async fn verified_zadd(
        &self,
        set: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
        score: f64,
    ) -> Result<TxHeader> {
        let set = set.into();
        let key = key.into();
        let encoded_key = encode_zset_key(&set, &key, score, 0);
        // Sorted-set entries store no value.
        self.verified_write(encoded_key, Vec::new(), move |transport, ctx, since| {
            let req = VerifiableZAddRequest {
                zadd_request: ZAddRequest {
                    set: set.clone(),
                    key: key.clone(),
                    score,
                    at_tx: 0,
                },
                prove_since_tx: since,
            };
            async move { transport.verifiable_zadd(&ctx, req).await }
        })
        .await
    }

    /// Verified transaction lookup: dual proof and signature only.
    pub async fn verified_tx_by_id(&self, tx: u64) -> Result<Tx> {
        let _guard = self.verified_lock.lock().await;
        let ctx = self.ctx()?;
        let db = self.session_db()?;
        let state = self.trusted_state(&ctx, &db).await?;

        let transport = self.transport().await?;
        let req = VerifiableTxRequest {
            tx,
            prove_since_tx: state.tx_id,
        };
        let reply = self.call(transport.verifiable_tx_by_id(&ctx, req)).await?;
        let vtx = self.accept(reply)?;

        if vtx.tx.header.id != tx {
            return Err(ClientError::CorruptedData(
                "server returned a different transaction".into(),
            ));
        }

        let anchor = resolve_anchor(&state, tx, &vtx.dual_proof)?;
        self.check_dual(&state, &anchor, &vtx.dual_proof)?;
        self.publish(&db, &anchor, vtx.signature.clone())?;
        Ok(vtx.tx)
    }

    /// Shared tail of the verified write operations: checks the committed
    /// transaction carries exactly the submitted entry, proves its inclusion,
    /// links the transaction to the trusted state, and publishes the new
    /// anchor.
    async fn verified_write<F, Fut>(
        &self,
        encoded_key: Vec<u8>,
        encoded_value: Vec<u8>,
        issue: F,
    ) -> Result<TxHeader>
    where
        F: FnOnce(Arc<dyn Transport>, CallContext, u64) -> Fut,
        Fut: Future<Output = TransportResult<Reply<VerifiableTx>>>,
    {
        let _guard = self.verified_lock.lock().await;
        let ctx = self.ctx()?;
        let db = self.session_db()?;
        let state = self.trusted_state(&ctx, &db).await?;

        let transport = self.transport().await?;
        let reply = self
            .call(issue(transport, ctx.clone(), state.tx_id))
            .await?;
        let vtx = self.accept(reply)?;

        let tx = &vtx.tx;
        let header = tx.header.clone();
        if header.nentries != 1 || tx.entries.len() != 1 {
            return Err(ClientError::CorruptedData(
                "committed transaction entry count mismatch".into(),
            ));
        }
        if tx.entries[0]
            .metadata
            .as_ref()
            .is_some_and(|m| m.deleted)
        {
            return Err(ClientError::CorruptedData(
                "freshly written entry is marked deleted".into(),
            ));
        }

        let leaf = entry_digest(
            &encoded_key,
            &value_digest(&encoded_value),
            encoded_value.len() as u32,
            None,
            header.version,
        )?;
        let proof = tx.proof(&encoded_key)?;
        if !htree::verify_inclusion(&proof, &leaf, &header.eh) {
            return Err(VerifyError::Inclusion.into());
        }

        let target_alh = header.alh()?;
        let dual = &vtx.dual_proof;
        if dual.target_tx_header.id != header.id || dual.target_tx_header.alh()? != target_alh {
            return Err(VerifyError::HeaderMismatch("committed transaction header").into());
        }
        if state.tx_id > 0 {
            proofs::verify_dual(dual, state.tx_id, header.id, &state.tx_hash, &target_alh)?;
        }

        let anchor = Anchor {
            target_id: header.id,
            target_alh,
            eh: header.eh,
            proven_header_version: header.version,
        };
        self.publish(&db, &anchor, vtx.signature.clone())?;
        tracing::debug!(tx = header.id, "verified write committed");
        Ok(header)
    }

    // ---- internals --------------------------------------------------------

    fn ctx(&self) -> Result<CallContext> {
        let session = self.sessions.current().ok_or(ClientError::NotOpen)?;
        Ok(CallContext {
            token: Some(session.token),
            deadline: self.options.call_timeout,
        })
    }

    fn session_db(&self) -> Result<String> {
        self.sessions
            .current()
            .map(|s| s.database)
            .ok_or(ClientError::NotOpen)
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.conn.read().await.transport()
    }

    async fn release_connection(&self) {
        let mut conn = self.conn.write().await;
        self.pool.release(&mut conn);
    }

    /// Runs one RPC under the configured deadline and maps its error.
    async fn call<T>(
        &self,
        fut: impl Future<Output = TransportResult<Reply<T>>>,
    ) -> Result<Reply<T>> {
        let result = match self.options.call_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::new(
                    TransportCode::DeadlineExceeded,
                    "call deadline exceeded",
                )),
            },
            None => fut.await,
        };
        result.map_err(map_transport_error)
    }

    /// Deployment check, then unwrap the body.
    fn accept<T>(&self, reply: Reply<T>) -> Result<T> {
        self.state.check_server_uuid(reply.server_uuid.as_deref())?;
        Ok(reply.body)
    }

    /// Trusted state for `db`, bootstrapping from the server on first use.
    async fn trusted_state(&self, ctx: &CallContext, db: &str) -> Result<TrustedState> {
        if let Some(state) = self.state.get(db)? {
            return Ok(state);
        }

        let transport = self.transport().await?;
        let reply = self.call(transport.current_state(ctx)).await?;
        let server_state = self.accept(reply)?;
        if server_state.db != db {
            return Err(ClientError::CorruptedData(
                "server state is for a different database".into(),
            ));
        }

        let state = TrustedState::new(
            db,
            server_state.tx_id,
            server_state.tx_hash,
            server_state.signature,
        );
        if state.tx_id > 0 {
            if let Some(key) = &self.signing_key {
                state.verify_signature(key)?;
            }
        }
        tracing::info!(db, tx = state.tx_id, "trusting server state on first use");
        self.state.set(&state)?;
        Ok(state)
    }

    /// Runs the dual proof for the resolved direction, honoring the two
    /// degenerate anchors.
    fn check_dual(
        &self,
        state: &TrustedState,
        anchor: &Anchor,
        dual: &veridb_verify::DualProof,
    ) -> Result<()> {
        let (source_id, target_id, source_alh, target_alh) = if state.tx_id <= anchor.target_id {
            (state.tx_id, anchor.target_id, state.tx_hash, anchor.target_alh)
        } else {
            // Reading history: this operation's tx is the source, the anchor
            // stays at the trusted state.
            (anchor.target_id, state.tx_id, anchor.target_alh, state.tx_hash)
        };

        if source_id == 0 {
            return Ok(());
        }
        if source_id == target_id {
            if source_alh != target_alh {
                return Err(VerifyError::AnchorMismatch.into());
            }
            return Ok(());
        }
        proofs::verify_dual(dual, source_id, target_id, &source_alh, &target_alh)?;
        Ok(())
    }

    /// Publishes the post-operation state. Only reached when every
    /// verification passed; the new anchor is the greater of the operation's
    /// transaction and the previous trust.
    fn publish(&self, db: &str, anchor: &Anchor, signature: Vec<u8>) -> Result<()> {
        let previous = self.state.get(db)?;
        let (tx_id, tx_hash) = match &previous {
            Some(prev) if prev.tx_id > anchor.target_id => (prev.tx_id, prev.tx_hash),
            _ => (anchor.target_id, anchor.target_alh),
        };
        let new_state = TrustedState::new(db, tx_id, tx_hash, signature);
        if let Some(key) = &self.signing_key {
            new_state.verify_signature(key)?;
        }
        self.state.set(&new_state)?;
        Ok(())
    }
}

/// The transaction this operation is anchored on, with the pieces of its
/// header the verified flows need.
struct Anchor {
    target_id: u64,
    target_alh: Digest,
    eh: Digest,
    proven_header_version: i32,
}

/// Picks the dual-proof header describing the operation's transaction and
/// derives its `alh`, binding the proof to the transaction the server
/// claims the entry lives in.
fn resolve_anchor(
    state: &TrustedState,
    proven_tx: u64,
    dual: &veridb_verify::DualProof,
) -> Result<Anchor> {
    let header = if state.tx_id <= proven_tx {
        &dual.target_tx_header
    } else {
        &dual.source_tx_header
    };
    if header.id != proven_tx {
        return Err(VerifyError::HeaderMismatch("operation transaction id").into());
    }
    Ok(Anchor {
        target_id: proven_tx,
        target_alh: header.alh()?,
        eh: header.eh,
        proven_header_version: header.version,
    })
}
