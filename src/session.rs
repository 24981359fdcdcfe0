//! Session lifecycle
//!
//! One authenticated session per client, guarded by a typed state machine:
//! `Closed → Opening → Open → Closing → Closed`. Transitions happen under a
//! mutex so concurrent opens/closes serialize, and illegal transitions
//! surface as `AlreadyOpen`/`NotOpen` instead of corrupting the token the
//! RPC headers embed. While open, a supervised keepalive task heartbeats the
//! server; its failures are logged and dropped, since the next user RPC
//! surfaces the real error.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::transport::{CallContext, OpenSessionRequest, Transport};
use crate::{map_transport_error, ClientError, Result};

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Bearer token attached to every RPC while the session is open.
    pub token: String,
    pub server_uuid: String,
    /// Database the session is bound to.
    pub database: String,
}

struct OpenSession {
    keepalive: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

enum SessionState {
    Closed,
    Opening,
    Open(OpenSession),
    Closing,
}

/// Serializes session setup and supervises the keepalive worker.
pub struct SessionManager {
    state: Mutex<SessionState>,
    current: RwLock<Option<Session>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Closed),
            current: RwLock::new(None),
        }
    }

    /// Snapshot of the active session, if any. Non-suspending.
    pub fn current(&self) -> Option<Session> {
        self.current.read().expect("session lock poisoned").clone()
    }

    /// Logs in and starts the keepalive loop.
    pub async fn open(
        &self,
        transport: Arc<dyn Transport>,
        user: &str,
        password: &str,
        database: &str,
        heartbeat_interval: Duration,
        call_timeout: Option<Duration>,
    ) -> Result<Session> {
        {
            let mut state = self.state.lock().await;
            match *state {
                SessionState::Closed => *state = SessionState::Opening,
                _ => return Err(ClientError::AlreadyOpen),
            }
        }

        let ctx = CallContext {
            token: None,
            deadline: call_timeout,
        };
        let reply = transport
            .open_session(
                &ctx,
                OpenSessionRequest {
                    user: user.to_string(),
                    password: password.to_string(),
                    database: database.to_string(),
                },
            )
            .await;

        let response = match reply {
            Ok(reply) => reply.body,
            Err(err) => {
                *self.state.lock().await = SessionState::Closed;
                return Err(map_transport_error(err));
            }
        };

        let session = Session {
            id: response.session_id,
            token: response.token,
            server_uuid: response.server_uuid,
            database: database.to_string(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let keepalive = spawn_keepalive(
            Arc::clone(&transport),
            session.token.clone(),
            heartbeat_interval,
            call_timeout,
            shutdown_rx,
        );

        {
            let mut state = self.state.lock().await;
            *state = SessionState::Open(OpenSession {
                keepalive,
                shutdown: shutdown_tx,
            });
            *self.current.write().expect("session lock poisoned") = Some(session.clone());
        }

        tracing::info!(session = %session.id, database, "session opened");
        Ok(session)
    }

    /// Stops the keepalive loop, waits for it, and invalidates the token.
    pub async fn close(
        &self,
        transport: Arc<dyn Transport>,
        call_timeout: Option<Duration>,
    ) -> Result<()> {
        let open = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, SessionState::Closing) {
                SessionState::Open(open) => open,
                other => {
                    *state = other;
                    return Err(ClientError::NotOpen);
                }
            }
        };

        // The keepalive task must be gone before the token dies, or a late
        // heartbeat would race the logout.
        let _ = open.shutdown.send(true);
        let _ = open.keepalive.await;

        let session = self
            .current
            .write()
            .expect("session lock poisoned")
            .take();

        let result = match session {
            Some(session) => {
                let ctx = CallContext {
                    token: Some(session.token),
                    deadline: call_timeout,
                };
                transport
                    .close_session(&ctx)
                    .await
                    .map(|_| ())
                    .map_err(map_transport_error)
            }
            None => Ok(()),
        };

        *self.state.lock().await = SessionState::Closed;
        tracing::info!("session closed");
        result
    }
}

fn spawn_keepalive(
    transport: Arc<dyn Transport>,
    token: String,
    interval: Duration,
    call_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the heartbeat starts
        // one interval after login.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let ctx = CallContext {
                        token: Some(token.clone()),
                        deadline: call_timeout,
                    };
                    if let Err(err) = transport.keep_alive(&ctx).await {
                        tracing::warn!(error = %err, "keepalive heartbeat failed");
                    }
                }
            }
        }
    })
}
