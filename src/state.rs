//! Trusted-state holder
//!
//! Owns the authoritative last-verified state per `(deployment, database)`.
//! Reads hand out snapshots; writes are atomic with respect to concurrent
//! reads. Persistence is pluggable: an in-memory store for throwaway
//! clients and a file-backed store whose records survive restarts via
//! write-to-temp plus atomic rename.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use sha2::{Digest as _, Sha256};

use veridb_verify::TrustedState;

use crate::{ClientError, Result};

/// Magic prefix of persisted state records.
const STATE_MAGIC: &[u8; 4] = b"VDBS";
/// Current record format version.
const STATE_FORMAT: u8 = 1;

/// Derives the deployment key for a server address: a short hash that keys
/// all persisted trust for that deployment.
pub fn deployment_key(server_addr: &str) -> String {
    let digest: [u8; 32] = Sha256::digest(server_addr.as_bytes()).into();
    hex::encode(&digest[..8])
}

/// Storage backend for trusted states and deployment info.
pub trait StateStore: Send + Sync {
    fn get(&self, deployment: &str, db: &str) -> Result<Option<TrustedState>>;
    fn set(&self, deployment: &str, state: &TrustedState) -> Result<()>;
    fn get_server_uuid(&self, deployment: &str) -> Result<Option<String>>;
    fn set_server_uuid(&self, deployment: &str, uuid: &str) -> Result<()>;
}

/// Keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<(String, String), TrustedState>>,
    uuids: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, deployment: &str, db: &str) -> Result<Option<TrustedState>> {
        let states = self.states.read().expect("state map poisoned");
        Ok(states.get(&(deployment.to_string(), db.to_string())).cloned())
    }

    fn set(&self, deployment: &str, state: &TrustedState) -> Result<()> {
        let mut states = self.states.write().expect("state map poisoned");
        states.insert((deployment.to_string(), state.db.clone()), state.clone());
        Ok(())
    }

    fn get_server_uuid(&self, deployment: &str) -> Result<Option<String>> {
        let uuids = self.uuids.read().expect("uuid map poisoned");
        Ok(uuids.get(deployment).cloned())
    }

    fn set_server_uuid(&self, deployment: &str, uuid: &str) -> Result<()> {
        let mut uuids = self.uuids.write().expect("uuid map poisoned");
        uuids.insert(deployment.to_string(), uuid.to_string());
        Ok(())
    }
}

/// Persists one small binary record per `(deployment, database)` plus a
/// deployment-info file recording the first server UUID seen.
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn state_path(&self, deployment: &str, db: &str) -> PathBuf {
        self.dir.join(format!("state_{deployment}_{}", hex::encode(db)))
    }

    fn uuid_path(&self, deployment: &str) -> PathBuf {
        self.dir.join(format!("deployment_{deployment}"))
    }

    /// Fixed-width record: magic ‖ format(1) ‖ txId(8) ‖ txHash(32) ‖
    /// dbLen(2) ‖ db ‖ sigLen(2) ‖ sig.
    fn encode_record(state: &TrustedState) -> Result<Vec<u8>> {
        if state.db.len() > u16::MAX as usize || state.signature.len() > u16::MAX as usize {
            return Err(ClientError::CorruptedData(
                "state fields exceed record limits".into(),
            ));
        }
        let mut out = Vec::with_capacity(4 + 1 + 8 + 32 + 2 + state.db.len() + 2);
        out.extend_from_slice(STATE_MAGIC);
        out.push(STATE_FORMAT);
        out.extend_from_slice(&state.tx_id.to_be_bytes());
        out.extend_from_slice(&state.tx_hash);
        out.extend_from_slice(&(state.db.len() as u16).to_be_bytes());
        out.extend_from_slice(state.db.as_bytes());
        out.extend_from_slice(&(state.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&state.signature);
        Ok(out)
    }

    fn decode_record(bytes: &[u8]) -> Result<TrustedState> {
        let corrupted = |what: &str| ClientError::CorruptedData(format!("state record: {what}"));

        if bytes.len() < 4 + 1 + 8 + 32 + 2 || &bytes[..4] != STATE_MAGIC {
            return Err(corrupted("bad header"));
        }
        if bytes[4] != STATE_FORMAT {
            return Err(corrupted("unknown format version"));
        }
        let mut tx_id = [0u8; 8];
        tx_id.copy_from_slice(&bytes[5..13]);
        let mut tx_hash = [0u8; 32];
        tx_hash.copy_from_slice(&bytes[13..45]);

        let db_len = u16::from_be_bytes([bytes[45], bytes[46]]) as usize;
        let db_end = 47 + db_len;
        if bytes.len() < db_end + 2 {
            return Err(corrupted("truncated database name"));
        }
        let db = std::str::from_utf8(&bytes[47..db_end])
            .map_err(|_| corrupted("database name is not utf-8"))?
            .to_string();

        let sig_len = u16::from_be_bytes([bytes[db_end], bytes[db_end + 1]]) as usize;
        let sig_end = db_end + 2 + sig_len;
        if bytes.len() != sig_end {
            return Err(corrupted("truncated signature"));
        }
        let signature = bytes[db_end + 2..sig_end].to_vec();

        Ok(TrustedState {
            db,
            tx_id: u64::from_be_bytes(tx_id),
            tx_hash,
            signature,
        })
    }

    fn write_atomic(&self, path: &PathBuf, bytes: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().expect("state write lock poisoned");
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, deployment: &str, db: &str) -> Result<Option<TrustedState>> {
        match fs::read(self.state_path(deployment, db)) {
            Ok(bytes) => Self::decode_record(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, deployment: &str, state: &TrustedState) -> Result<()> {
        let record = Self::encode_record(state)?;
        self.write_atomic(&self.state_path(deployment, &state.db), &record)
    }

    fn get_server_uuid(&self, deployment: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.uuid_path(deployment)) {
            Ok(uuid) => Ok(Some(uuid)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_server_uuid(&self, deployment: &str, uuid: &str) -> Result<()> {
        self.write_atomic(&self.uuid_path(deployment), uuid.as_bytes())
    }
}

/// Scopes a [`StateStore`] to one deployment and enforces the
/// deployment-info check.
pub struct StateHolder {
    store: Box<dyn StateStore>,
    deployment: String,
    check_deployment: bool,
}

impl StateHolder {
    pub fn new(store: Box<dyn StateStore>, server_addr: &str, check_deployment: bool) -> Self {
        Self {
            store,
            deployment: deployment_key(server_addr),
            check_deployment,
        }
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    /// Snapshot of the trusted state for `db`, if any.
    pub fn get(&self, db: &str) -> Result<Option<TrustedState>> {
        self.store.get(&self.deployment, db)
    }

    /// Publishes a freshly verified state.
    pub fn set(&self, state: &TrustedState) -> Result<()> {
        self.store.set(&self.deployment, state)
    }

    /// Compares the server UUID from a response against the one first seen
    /// for this deployment, recording it on first contact. Divergence means
    /// the address now points at a different deployment, and trusting it
    /// would silently discard the existing anchor.
    pub fn check_server_uuid(&self, uuid: Option<&str>) -> Result<()> {
        if !self.check_deployment {
            return Ok(());
        }
        let Some(uuid) = uuid else {
            return Ok(());
        };
        match self.store.get_server_uuid(&self.deployment)? {
            Some(known) if known != uuid => Err(ClientError::DeploymentMismatch {
                expected: known,
                actual: uuid.to_string(),
            }),
            Some(_) => Ok(()),
            None => self.store.set_server_uuid(&self.deployment, uuid),
        }
    }
}
