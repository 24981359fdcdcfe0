//! In-process server for driver tests
//!
//! Maintains an honest append-only log: a real alh chain, a binary-linked
//! accumulator, and per-transaction entry trees, so every proof it hands out
//! verifies exactly like a production server's. Tamper hooks let tests
//! corrupt responses after proof generation to exercise the rejection paths.

// Each integration test binary compiles its own copy; not every binary uses
// every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};

use veridb_client::pool::{ConnectParams, ConnectionFactory};
use veridb_client::transport::{
    CallContext, DeleteRequest, HistoryRequest, KeyRequest, OpenSessionRequest,
    OpenSessionResponse, ReferenceRequest, Reply, ScanRequest, ServerState, SetRequest, Transport,
    TransportCode, TransportError, TransportResult, TxRequest, TxScanRequest,
    VerifiableEntry, VerifiableGetRequest, VerifiableReferenceRequest, VerifiableSetRequest,
    VerifiableTx, VerifiableTxRequest, VerifiableZAddRequest, ZAddRequest, ZScanRequest,
};
use veridb_verify::ahtree::AhTree;
use veridb_verify::digest::{
    encode_plain_value, encode_reference_value, encode_zset_key, value_digest, Digest,
};
use veridb_verify::{
    DualProof, Entry, EntryMetadata, InclusionProof, LinearProof, Reference, Tx, TxEntry,
    TxHeader, ZEntry,
};

pub type EntryTamper = Box<dyn Fn(&mut VerifiableEntry) + Send + Sync>;
pub type TxTamper = Box<dyn Fn(&mut VerifiableTx) + Send + Sync>;

const TX_VERSION: i32 = 1;

struct StoredTx {
    header: TxHeader,
    entries: Vec<TxEntry>,
    alh: Digest,
}

#[derive(Clone)]
struct KvPointer {
    tx: u64,
    entry_index: usize,
    value: Vec<u8>,
    metadata: Option<EntryMetadata>,
}

#[derive(Clone)]
struct StoredRef {
    tx: u64,
    entry_index: usize,
    target: Vec<u8>,
    at_tx: u64,
}

#[derive(Clone)]
struct StoredZ {
    tx: u64,
    entry_index: usize,
    key: Vec<u8>,
    score: f64,
}

#[derive(Default)]
struct LogInner {
    txs: Vec<StoredTx>,
    aht: AhTree,
    kv: HashMap<Vec<u8>, Vec<KvPointer>>,
    refs: HashMap<Vec<u8>, StoredRef>,
    zsets: HashMap<Vec<u8>, Vec<StoredZ>>,
    tokens: Vec<String>,
}

enum CommitPayload {
    Plain {
        key: Vec<u8>,
        value: Vec<u8>,
        metadata: Option<EntryMetadata>,
    },
    Reference {
        key: Vec<u8>,
        target: Vec<u8>,
        at_tx: u64,
    },
    ZMember {
        set: Vec<u8>,
        key: Vec<u8>,
        score: f64,
    },
}

pub struct FakeServer {
    db: String,
    uuid: Mutex<String>,
    users: HashMap<String, String>,
    signing: Option<SigningKey>,
    inner: Mutex<LogInner>,
    session_counter: AtomicUsize,
    pub keepalives: AtomicUsize,
    entry_tamper: Mutex<Option<EntryTamper>>,
    tx_tamper: Mutex<Option<TxTamper>>,
    /// Hand deleted entries back instead of reporting a miss; models a
    /// misbehaving server for the rejection tests.
    pub serve_deleted: std::sync::atomic::AtomicBool,
}

impl FakeServer {
    pub fn new(db: &str) -> Arc<Self> {
        Self::build(db, None)
    }

    pub fn with_signing(db: &str, signing: SigningKey) -> Arc<Self> {
        Self::build(db, Some(signing))
    }

    fn build(db: &str, signing: Option<SigningKey>) -> Arc<Self> {
        let mut users = HashMap::new();
        users.insert("veridb".to_string(), "veridb".to_string());
        Arc::new(Self {
            db: db.to_string(),
            uuid: Mutex::new("deployment-uuid-1".to_string()),
            users,
            signing,
            inner: Mutex::new(LogInner::default()),
            session_counter: AtomicUsize::new(0),
            keepalives: AtomicUsize::new(0),
            entry_tamper: Mutex::new(None),
            tx_tamper: Mutex::new(None),
            serve_deleted: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn set_uuid(&self, uuid: &str) {
        *self.uuid.lock().unwrap() = uuid.to_string();
    }

    pub fn set_entry_tamper(&self, tamper: Option<EntryTamper>) {
        *self.entry_tamper.lock().unwrap() = tamper;
    }

    pub fn set_tx_tamper(&self, tamper: Option<TxTamper>) {
        *self.tx_tamper.lock().unwrap() = tamper;
    }

    fn uuid(&self) -> String {
        self.uuid.lock().unwrap().clone()
    }

    fn check_auth(&self, ctx: &CallContext, inner: &LogInner) -> TransportResult<()> {
        match &ctx.token {
            Some(token) if inner.tokens.contains(token) => Ok(()),
            _ => Err(TransportError::new(
                TransportCode::Unauthenticated,
                "invalid session token",
            )),
        }
    }

    fn sign_state(&self, tx_id: u64, tx_hash: &Digest) -> Vec<u8> {
        match &self.signing {
            Some(key) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(self.db.as_bytes());
                payload.extend_from_slice(&tx_id.to_be_bytes());
                payload.extend_from_slice(tx_hash);
                let signature: Signature = key.sign(&payload);
                signature.to_der().as_bytes().to_vec()
            }
            None => Vec::new(),
        }
    }

    fn commit(inner: &mut LogInner, payloads: Vec<CommitPayload>) -> u64 {
        let mut entries = Vec::new();
        for payload in &payloads {
            let (key, encoded_value, metadata) = match payload {
                CommitPayload::Plain { key, value, metadata } => {
                    (key.clone(), encode_plain_value(value), metadata.clone())
                }
                CommitPayload::Reference { key, target, at_tx } => {
                    (key.clone(), encode_reference_value(target, *at_tx), None)
                }
                CommitPayload::ZMember { set, key, score } => {
                    (encode_zset_key(set, key, *score, 0), Vec::new(), None)
                }
            };
            entries.push(TxEntry {
                key,
                h_value: value_digest(&encoded_value),
                v_len: encoded_value.len() as u32,
                metadata,
            });
        }

        let id = inner.txs.len() as u64 + 1;
        let prev_alh = inner.txs.last().map(|t| t.alh).unwrap_or([0u8; 32]);
        let bl_tx_id = inner.aht.size();
        let bl_root = if bl_tx_id > 0 {
            inner.aht.root_at(bl_tx_id).unwrap()
        } else {
            [0u8; 32]
        };

        let leaves: Vec<Digest> = entries
            .iter()
            .map(|e| e.digest(TX_VERSION).unwrap())
            .collect();
        let eh = veridb_verify::htree::HTree::new(leaves).unwrap().root();

        let header = TxHeader {
            id,
            prev_alh,
            ts: 1_700_000_000 + id as i64,
            version: TX_VERSION,
            metadata: Vec::new(),
            nentries: entries.len() as u32,
            eh,
            bl_tx_id,
            bl_root,
        };
        let alh = header.alh().unwrap();
        inner.aht.append(&alh);

        for (index, payload) in payloads.into_iter().enumerate() {
            match payload {
                CommitPayload::Plain { key, value, metadata } => {
                    inner.kv.entry(key).or_default().push(KvPointer {
                        tx: id,
                        entry_index: index,
                        value,
                        metadata,
                    });
                }
                CommitPayload::Reference { key, target, at_tx } => {
                    inner.refs.insert(
                        key,
                        StoredRef {
                            tx: id,
                            entry_index: index,
                            target,
                            at_tx,
                        },
                    );
                }
                CommitPayload::ZMember { set, key, score } => {
                    inner.zsets.entry(set).or_default().push(StoredZ {
                        tx: id,
                        entry_index: index,
                        key,
                        score,
                    });
                }
            }
        }

        inner.txs.push(StoredTx { header, entries, alh });
        id
    }

    fn linear_proof(inner: &LogInner, from: u64, to: u64) -> LinearProof {
        let mut terms = vec![inner.txs[(from - 1) as usize].alh];
        for id in from + 1..=to {
            terms.push(inner.txs[(id - 1) as usize].header.inner_hash().unwrap());
        }
        LinearProof {
            source_tx_id: from,
            target_tx_id: to,
            terms,
        }
    }

    fn dual_proof(inner: &LogInner, source_id: u64, target_id: u64) -> DualProof {
        let source_header = inner.txs[(source_id - 1) as usize].header.clone();
        let target_header = inner.txs[(target_id - 1) as usize].header.clone();
        let target_bl = target_header.bl_tx_id;

        let inclusion_proof = if source_id < target_bl {
            inner.aht.inclusion_proof(source_id, target_bl).unwrap()
        } else {
            Vec::new()
        };
        let consistency_proof = if source_id < target_bl && source_header.bl_tx_id > 0 {
            inner
                .aht
                .consistency_proof(source_header.bl_tx_id, target_bl)
                .unwrap()
        } else {
            Vec::new()
        };
        let (target_bl_tx_alh, last_inclusion_proof) = if target_bl > 0 {
            (
                inner.txs[(target_bl - 1) as usize].alh,
                inner.aht.inclusion_proof(target_bl, target_bl).unwrap(),
            )
        } else {
            ([0u8; 32], Vec::new())
        };
        let linear_proof = if source_id < target_bl {
            Self::linear_proof(inner, target_bl, target_id)
        } else {
            Self::linear_proof(inner, source_id, target_id)
        };

        DualProof {
            source_tx_header: source_header,
            target_tx_header: target_header,
            inclusion_proof,
            consistency_proof,
            target_bl_tx_alh,
            last_inclusion_proof,
            linear_proof,
        }
    }

    /// Builds the verifiable wrapper for `op_tx`, proving from
    /// `prove_since_tx` in whichever direction applies.
    fn verifiable_tx(&self, inner: &LogInner, op_tx: u64, prove_since_tx: u64) -> VerifiableTx {
        let (source_id, target_id) = if prove_since_tx == 0 || prove_since_tx == op_tx {
            (op_tx, op_tx)
        } else if prove_since_tx < op_tx {
            (prove_since_tx, op_tx)
        } else {
            (op_tx, prove_since_tx)
        };

        let dual = if source_id == target_id {
            let header = inner.txs[(op_tx - 1) as usize].header.clone();
            DualProof {
                source_tx_header: header.clone(),
                target_tx_header: header,
                inclusion_proof: Vec::new(),
                consistency_proof: Vec::new(),
                target_bl_tx_alh: [0u8; 32],
                last_inclusion_proof: Vec::new(),
                linear_proof: Self::linear_proof(inner, op_tx, op_tx),
            }
        } else {
            Self::dual_proof(inner, source_id, target_id)
        };

        let stored = &inner.txs[(op_tx - 1) as usize];
        let target_alh = inner.txs[(target_id - 1) as usize].alh;
        VerifiableTx {
            tx: Tx {
                header: stored.header.clone(),
                entries: stored.entries.clone(),
            },
            dual_proof: dual,
            signature: self.sign_state(target_id, &target_alh),
        }
    }

    fn resolve_plain(
        inner: &LogInner,
        key: &[u8],
        at_tx: u64,
        serve_deleted: bool,
    ) -> TransportResult<(KvPointer, i64)> {
        let history = inner
            .kv
            .get(key)
            .ok_or_else(|| TransportError::new(TransportCode::NotFound, "key not found"))?;
        let (pointer, revision) = if at_tx == 0 {
            let pointer = history.last().unwrap().clone();
            (pointer, history.len() as i64)
        } else {
            let position = history
                .iter()
                .position(|p| p.tx == at_tx)
                .ok_or_else(|| TransportError::new(TransportCode::NotFound, "key not found"))?;
            (history[position].clone(), (position + 1) as i64)
        };
        if pointer.metadata.as_ref().is_some_and(|m| m.deleted) && !serve_deleted {
            return Err(TransportError::new(TransportCode::NotFound, "key not found"));
        }
        Ok((pointer, revision))
    }

    fn resolve(&self, inner: &LogInner, req: &KeyRequest) -> TransportResult<(Entry, u64, usize)> {
        let serve_deleted = self.serve_deleted.load(Ordering::SeqCst);
        if let Some(stored_ref) = inner.refs.get(&req.key) {
            let (pointer, revision) =
                Self::resolve_plain(inner, &stored_ref.target, stored_ref.at_tx, serve_deleted)?;
            let entry = Entry {
                tx: pointer.tx,
                key: stored_ref.target.clone(),
                value: pointer.value,
                metadata: pointer.metadata,
                revision,
                referenced_by: Some(Reference {
                    tx: stored_ref.tx,
                    key: req.key.clone(),
                    at_tx: stored_ref.at_tx,
                    metadata: None,
                }),
            };
            return Ok((entry, stored_ref.tx, stored_ref.entry_index));
        }

        let (pointer, revision) = Self::resolve_plain(inner, &req.key, req.at_tx, serve_deleted)?;
        let entry = Entry {
            tx: pointer.tx,
            key: req.key.clone(),
            value: pointer.value.clone(),
            metadata: pointer.metadata.clone(),
            revision,
            referenced_by: None,
        };
        Ok((entry, pointer.tx, pointer.entry_index))
    }

    fn inclusion_in_tx(inner: &LogInner, tx_id: u64, entry_index: usize) -> InclusionProof {
        let stored = &inner.txs[(tx_id - 1) as usize];
        let tx = Tx {
            header: stored.header.clone(),
            entries: stored.entries.clone(),
        };
        tx.build_entry_tree()
            .unwrap()
            .inclusion_proof(entry_index)
            .unwrap()
    }

    fn current_state_inner(&self, inner: &LogInner) -> ServerState {
        let tx_id = inner.txs.len() as u64;
        let tx_hash = inner.txs.last().map(|t| t.alh).unwrap_or([0u8; 32]);
        ServerState {
            db: self.db.clone(),
            tx_id,
            tx_hash,
            signature: if tx_id > 0 {
                self.sign_state(tx_id, &tx_hash)
            } else {
                Vec::new()
            },
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn open_session(
        &self,
        _ctx: &CallContext,
        req: OpenSessionRequest,
    ) -> TransportResult<Reply<OpenSessionResponse>> {
        match self.users.get(&req.user) {
            Some(password) if *password == req.password => {}
            _ => {
                return Err(TransportError::new(
                    TransportCode::Unauthenticated,
                    "invalid user name or password",
                ))
            }
        }
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        let token = format!("session-token-{n}");
        self.inner.lock().unwrap().tokens.push(token.clone());
        Ok(Reply::new(
            self.uuid(),
            OpenSessionResponse {
                session_id: format!("session-{n}"),
                token,
                server_uuid: self.uuid(),
            },
        ))
    }

    async fn close_session(&self, ctx: &CallContext) -> TransportResult<Reply<()>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let token = ctx.token.clone().unwrap();
        inner.tokens.retain(|t| *t != token);
        Ok(Reply::new(self.uuid(), ()))
    }

    async fn keep_alive(&self, ctx: &CallContext) -> TransportResult<Reply<()>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::new(self.uuid(), ()))
    }

    async fn health_check(&self, ctx: &CallContext) -> TransportResult<Reply<bool>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        Ok(Reply::new(self.uuid(), true))
    }

    async fn current_state(&self, ctx: &CallContext) -> TransportResult<Reply<ServerState>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        Ok(Reply::new(self.uuid(), self.current_state_inner(&inner)))
    }

    async fn get(&self, ctx: &CallContext, req: KeyRequest) -> TransportResult<Reply<Entry>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let (entry, _, _) = self.resolve(&inner, &req)?;
        Ok(Reply::new(self.uuid(), entry))
    }

    async fn get_all(
        &self,
        ctx: &CallContext,
        keys: Vec<Vec<u8>>,
    ) -> TransportResult<Reply<Vec<Entry>>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let mut entries = Vec::new();
        for key in keys {
            if let Ok((entry, _, _)) = self.resolve(&inner, &KeyRequest::new(key)) {
                entries.push(entry);
            }
        }
        Ok(Reply::new(self.uuid(), entries))
    }

    async fn verifiable_get(
        &self,
        ctx: &CallContext,
        req: VerifiableGetRequest,
    ) -> TransportResult<Reply<VerifiableEntry>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let (entry, proven_tx, entry_index) = self.resolve(&inner, &req.key_request)?;
        let mut ventry = VerifiableEntry {
            entry,
            verifiable_tx: self.verifiable_tx(&inner, proven_tx, req.prove_since_tx),
            inclusion_proof: Self::inclusion_in_tx(&inner, proven_tx, entry_index),
        };
        if let Some(tamper) = self.entry_tamper.lock().unwrap().as_ref() {
            tamper(&mut ventry);
        }
        Ok(Reply::new(self.uuid(), ventry))
    }

    async fn set(&self, ctx: &CallContext, req: SetRequest) -> TransportResult<Reply<TxHeader>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let payloads = req
            .kvs
            .into_iter()
            .map(|kv| CommitPayload::Plain {
                key: kv.key,
                value: kv.value,
                metadata: kv.metadata,
            })
            .collect();
        let id = Self::commit(&mut inner, payloads);
        Ok(Reply::new(
            self.uuid(),
            inner.txs[(id - 1) as usize].header.clone(),
        ))
    }

    async fn verifiable_set(
        &self,
        ctx: &CallContext,
        req: VerifiableSetRequest,
    ) -> TransportResult<Reply<VerifiableTx>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let payloads = req
            .set_request
            .kvs
            .into_iter()
            .map(|kv| CommitPayload::Plain {
                key: kv.key,
                value: kv.value,
                metadata: kv.metadata,
            })
            .collect();
        let id = Self::commit(&mut inner, payloads);
        let mut vtx = self.verifiable_tx(&inner, id, req.prove_since_tx);
        if let Some(tamper) = self.tx_tamper.lock().unwrap().as_ref() {
            tamper(&mut vtx);
        }
        Ok(Reply::new(self.uuid(), vtx))
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        req: DeleteRequest,
    ) -> TransportResult<Reply<TxHeader>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let payloads = req
            .keys
            .into_iter()
            .map(|key| CommitPayload::Plain {
                key,
                value: Vec::new(),
                metadata: Some(EntryMetadata {
                    deleted: true,
                    ..Default::default()
                }),
            })
            .collect();
        let id = Self::commit(&mut inner, payloads);
        Ok(Reply::new(
            self.uuid(),
            inner.txs[(id - 1) as usize].header.clone(),
        ))
    }

    async fn set_reference(
        &self,
        ctx: &CallContext,
        req: ReferenceRequest,
    ) -> TransportResult<Reply<TxHeader>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let id = Self::commit(
            &mut inner,
            vec![CommitPayload::Reference {
                key: req.key,
                target: req.referenced_key,
                at_tx: req.at_tx,
            }],
        );
        Ok(Reply::new(
            self.uuid(),
            inner.txs[(id - 1) as usize].header.clone(),
        ))
    }

    async fn verifiable_set_reference(
        &self,
        ctx: &CallContext,
        req: VerifiableReferenceRequest,
    ) -> TransportResult<Reply<VerifiableTx>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let id = Self::commit(
            &mut inner,
            vec![CommitPayload::Reference {
                key: req.reference_request.key,
                target: req.reference_request.referenced_key,
                at_tx: req.reference_request.at_tx,
            }],
        );
        let mut vtx = self.verifiable_tx(&inner, id, req.prove_since_tx);
        if let Some(tamper) = self.tx_tamper.lock().unwrap().as_ref() {
            tamper(&mut vtx);
        }
        Ok(Reply::new(self.uuid(), vtx))
    }

    async fn zadd(&self, ctx: &CallContext, req: ZAddRequest) -> TransportResult<Reply<TxHeader>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let id = Self::commit(
            &mut inner,
            vec![CommitPayload::ZMember {
                set: req.set,
                key: req.key,
                score: req.score,
            }],
        );
        Ok(Reply::new(
            self.uuid(),
            inner.txs[(id - 1) as usize].header.clone(),
        ))
    }

    async fn verifiable_zadd(
        &self,
        ctx: &CallContext,
        req: VerifiableZAddRequest,
    ) -> TransportResult<Reply<VerifiableTx>> {
        let mut inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let id = Self::commit(
            &mut inner,
            vec![CommitPayload::ZMember {
                set: req.zadd_request.set,
                key: req.zadd_request.key,
                score: req.zadd_request.score,
            }],
        );
        let mut vtx = self.verifiable_tx(&inner, id, req.prove_since_tx);
        if let Some(tamper) = self.tx_tamper.lock().unwrap().as_ref() {
            tamper(&mut vtx);
        }
        Ok(Reply::new(self.uuid(), vtx))
    }

    async fn scan(
        &self,
        ctx: &CallContext,
        req: ScanRequest,
    ) -> TransportResult<Reply<Vec<Entry>>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let mut keys: Vec<&Vec<u8>> = inner
            .kv
            .keys()
            .filter(|k| k.starts_with(&req.prefix))
            .collect();
        keys.sort();
        if req.desc {
            keys.reverse();
        }
        let mut entries = Vec::new();
        for key in keys {
            if req.limit > 0 && entries.len() as u64 >= req.limit {
                break;
            }
            if let Ok((entry, _, _)) = self.resolve(&inner, &KeyRequest::new(key.clone())) {
                entries.push(entry);
            }
        }
        Ok(Reply::new(self.uuid(), entries))
    }

    async fn zscan(
        &self,
        ctx: &CallContext,
        req: ZScanRequest,
    ) -> TransportResult<Reply<Vec<ZEntry>>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let mut members = inner.zsets.get(&req.set).cloned().unwrap_or_default();
        members.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap()
                .then_with(|| a.key.cmp(&b.key))
        });
        if req.reverse {
            members.reverse();
        }
        let mut out = Vec::new();
        for member in members {
            if req.limit > 0 && out.len() as u64 >= req.limit {
                break;
            }
            let (entry, _, _) = self.resolve(&inner, &KeyRequest::new(member.key.clone()))?;
            out.push(ZEntry {
                set: req.set.clone(),
                key: member.key,
                score: member.score,
                at_tx: 0,
                entry,
            });
        }
        Ok(Reply::new(self.uuid(), out))
    }

    async fn history(
        &self,
        ctx: &CallContext,
        req: HistoryRequest,
    ) -> TransportResult<Reply<Vec<Entry>>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let history = inner
            .kv
            .get(&req.key)
            .ok_or_else(|| TransportError::new(TransportCode::NotFound, "key not found"))?;
        let mut entries: Vec<Entry> = history
            .iter()
            .enumerate()
            .map(|(i, p)| Entry {
                tx: p.tx,
                key: req.key.clone(),
                value: p.value.clone(),
                metadata: p.metadata.clone(),
                revision: (i + 1) as i64,
                referenced_by: None,
            })
            .collect();
        if req.desc {
            entries.reverse();
        }
        let entries = entries
            .into_iter()
            .skip(req.offset as usize)
            .take(if req.limit == 0 {
                usize::MAX
            } else {
                req.limit as usize
            })
            .collect();
        Ok(Reply::new(self.uuid(), entries))
    }

    async fn tx_by_id(&self, ctx: &CallContext, req: TxRequest) -> TransportResult<Reply<Tx>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let stored = inner
            .txs
            .get((req.tx.max(1) - 1) as usize)
            .filter(|_| req.tx >= 1)
            .ok_or_else(|| TransportError::new(TransportCode::NotFound, "tx not found"))?;
        Ok(Reply::new(
            self.uuid(),
            Tx {
                header: stored.header.clone(),
                entries: stored.entries.clone(),
            },
        ))
    }

    async fn verifiable_tx_by_id(
        &self,
        ctx: &CallContext,
        req: VerifiableTxRequest,
    ) -> TransportResult<Reply<VerifiableTx>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        if req.tx == 0 || req.tx > inner.txs.len() as u64 {
            return Err(TransportError::new(TransportCode::NotFound, "tx not found"));
        }
        let mut vtx = self.verifiable_tx(&inner, req.tx, req.prove_since_tx);
        if let Some(tamper) = self.tx_tamper.lock().unwrap().as_ref() {
            tamper(&mut vtx);
        }
        Ok(Reply::new(self.uuid(), vtx))
    }

    async fn tx_scan(
        &self,
        ctx: &CallContext,
        req: TxScanRequest,
    ) -> TransportResult<Reply<Vec<Tx>>> {
        let inner = self.inner.lock().unwrap();
        self.check_auth(ctx, &inner)?;
        let initial = req.initial_tx.max(1);
        let mut txs: Vec<Tx> = inner
            .txs
            .iter()
            .filter(|t| t.header.id >= initial)
            .map(|t| Tx {
                header: t.header.clone(),
                entries: t.entries.clone(),
            })
            .collect();
        if req.desc {
            txs.reverse();
        }
        if req.limit > 0 {
            txs.truncate(req.limit as usize);
        }
        Ok(Reply::new(self.uuid(), txs))
    }
}

/// Factory handing out the same in-process server for every address.
pub struct FakeFactory {
    server: Arc<FakeServer>,
}

impl FakeFactory {
    pub fn new(server: Arc<FakeServer>) -> Arc<dyn ConnectionFactory> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, _params: &ConnectParams) -> TransportResult<Arc<dyn Transport>> {
        Ok(Arc::clone(&self.server) as Arc<dyn Transport>)
    }
}
