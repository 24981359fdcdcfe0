//! Connection pool
//!
//! Hands out multiplexed transports keyed by server address, capped at
//! `max_connections_per_server` concurrent holders; excess acquires wait for
//! a slot. Released transports go back to an idle list where a background
//! sweeper tears them down after the configured idle timeout. The pool is an
//! explicit collaborator injected into the client; a process-wide default
//! instance is available for convenience.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::transport::{Transport, TransportCode, TransportResult};
use crate::{ClientError, Result};

/// Everything a factory needs to dial one server.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// `host:port` target; also the pool key.
    pub addr: String,
    /// Negotiate TLS on the new transport.
    pub use_tls: bool,
}

impl ConnectParams {
    pub fn new(addr: impl Into<String>, use_tls: bool) -> Self {
        Self {
            addr: addr.into(),
            use_tls,
        }
    }
}

/// Creates transports for server addresses; injected so the pool never
/// depends on a concrete wire implementation.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> TransportResult<Arc<dyn Transport>>;
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections_per_server: usize,
    pub idle_check_interval: Duration,
    pub terminate_idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections_per_server: crate::config::DEFAULT_MAX_CONNECTIONS_PER_SERVER,
            idle_check_interval: crate::config::DEFAULT_IDLE_CHECK_INTERVAL,
            terminate_idle_timeout: crate::config::DEFAULT_TERMINATE_IDLE_TIMEOUT,
            shutdown_grace: crate::config::DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// A pooled transport, or the released sentinel.
///
/// Every RPC goes through [`Connection::transport`], so an operation racing a
/// release gets a uniform `ConnectionReleased` error instead of a dangling
/// handle.
pub enum Connection {
    Active(ActiveConnection),
    Released,
}

pub struct ActiveConnection {
    transport: Arc<dyn Transport>,
    addr: String,
    // Slot permit; dropping it frees capacity for waiting acquires.
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        match self {
            Connection::Active(active) => Ok(Arc::clone(&active.transport)),
            Connection::Released => Err(ClientError::ConnectionReleased),
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self, Connection::Released)
    }
}

struct IdleConnection {
    transport: Arc<dyn Transport>,
    since: Instant,
}

struct ServerSlot {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
}

/// Multiplexed connection pool, internally synchronized.
pub struct ConnectionPool {
    options: PoolOptions,
    servers: Mutex<HashMap<String, Arc<ServerSlot>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

static GLOBAL_POOL: OnceLock<Arc<ConnectionPool>> = OnceLock::new();

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            servers: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Process-wide default pool with default options.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| ConnectionPool::new(PoolOptions::default())))
    }

    /// Acquires a transport for `params.addr`, reusing an idle one when
    /// available. Waits when the per-server cap is reached.
    pub async fn acquire(
        self: &Arc<Self>,
        params: &ConnectParams,
        factory: &Arc<dyn ConnectionFactory>,
    ) -> Result<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Transport {
                code: TransportCode::Unavailable,
                message: "connection pool is shut down".into(),
            });
        }
        self.ensure_sweeper();

        let slot = self.slot(&params.addr);
        let permit = Arc::clone(&slot.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Transport {
                code: TransportCode::Unavailable,
                message: "connection pool is shut down".into(),
            })?;

        let reused = {
            let mut idle = slot.idle.lock().expect("idle list poisoned");
            idle.pop().map(|conn| conn.transport)
        };
        let transport = match reused {
            Some(transport) => transport,
            None => {
                tracing::debug!(addr = %params.addr, "opening new pooled connection");
                factory
                    .connect(params)
                    .await
                    .map_err(crate::map_transport_error)?
            }
        };

        Ok(Connection::Active(ActiveConnection {
            transport,
            addr: params.addr.clone(),
            _permit: permit,
        }))
    }

    /// Returns a connection to the idle list and swaps the caller's handle
    /// for the released sentinel.
    pub fn release(&self, conn: &mut Connection) {
        match std::mem::replace(conn, Connection::Released) {
            Connection::Active(active) => {
                if let Some(slot) = self.existing_slot(&active.addr) {
                    let mut idle = slot.idle.lock().expect("idle list poisoned");
                    idle.push(IdleConnection {
                        transport: active.transport,
                        since: Instant::now(),
                    });
                }
                // Permit drops here, freeing the slot.
            }
            Connection::Released => {}
        }
    }

    /// Drains the pool: waits up to the grace period for in-flight holders,
    /// then closes everything. Pending acquires fail once their slot closes.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }

        let slots: Vec<Arc<ServerSlot>> = {
            let mut servers = self.servers.lock().expect("server map poisoned");
            servers.drain().map(|(_, slot)| slot).collect()
        };

        let deadline = Instant::now() + self.options.shutdown_grace;
        for slot in slots {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let max = self.options.max_connections_per_server as u32;
            let drained =
                tokio::time::timeout(remaining, slot.semaphore.acquire_many(max)).await;
            if drained.is_err() {
                tracing::warn!("pool shutdown grace elapsed with calls in flight");
            }
            slot.semaphore.close();
            slot.idle.lock().expect("idle list poisoned").clear();
        }
    }

    fn slot(&self, addr: &str) -> Arc<ServerSlot> {
        let mut servers = self.servers.lock().expect("server map poisoned");
        Arc::clone(servers.entry(addr.to_string()).or_insert_with(|| {
            Arc::new(ServerSlot {
                semaphore: Arc::new(Semaphore::new(self.options.max_connections_per_server)),
                idle: Mutex::new(Vec::new()),
            })
        }))
    }

    fn existing_slot(&self, addr: &str) -> Option<Arc<ServerSlot>> {
        let servers = self.servers.lock().expect("server map poisoned");
        servers.get(addr).cloned()
    }

    /// Spawns the idle sweeper on first use; deferred so the pool can be
    /// constructed outside a runtime.
    fn ensure_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().expect("sweeper lock poisoned");
        if sweeper.is_some() {
            return;
        }
        let pool = Arc::downgrade(self);
        let interval = self.options.idle_check_interval;
        let max_idle = self.options.terminate_idle_timeout;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                let slots: Vec<Arc<ServerSlot>> = {
                    let servers = pool.servers.lock().expect("server map poisoned");
                    servers.values().cloned().collect()
                };
                for slot in slots {
                    let mut idle = slot.idle.lock().expect("idle list poisoned");
                    let before = idle.len();
                    idle.retain(|conn| conn.since.elapsed() < max_idle);
                    let dropped = before - idle.len();
                    if dropped > 0 {
                        tracing::debug!(dropped, "closed idle connections");
                    }
                }
            }
        }));
    }
}
