use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::Session,
    protocol::{AuthenticateRequest, AuthenticateResponse, ClientFrame, SessionValidity},
};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::{
    error::{SyncError, SyncResult},
    exclusive::ExclusiveTaskQueue,
};

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn authenticate(&self, request: &AuthenticateRequest) -> Result<AuthenticateResponse>;
    async fn validate(&self, token: &str) -> Result<SessionValidity>;
    async fn end_session(&self, token: &str) -> Result<()>;
    async fn valid_token(&self) -> Result<String>;
}

#[async_trait]
pub trait SocketConnection: Send + Sync {
    async fn connect(&self, token: &str) -> Result<bool>;
    async fn disconnect(&self) -> Result<bool>;
    fn is_connected(&self) -> bool;
    fn has_socket(&self) -> bool;
    async fn send(&self, frame: ClientFrame) -> Result<()>;
}

pub struct MissingSocket;

#[async_trait]
impl SocketConnection for MissingSocket {
    async fn connect(&self, _token: &str) -> Result<bool> {
        Err(anyhow!("push socket is unavailable"))
    }

    async fn disconnect(&self) -> Result<bool> {
        Ok(false)
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn has_socket(&self) -> bool {
        false
    }

    async fn send(&self, _frame: ClientFrame) -> Result<()> {
        Err(anyhow!("push socket is unavailable"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Disconnecting,
    /// The provider reported the session expired; only a restart recovers.
    Expired,
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    token: Option<String>,
}

pub struct SessionConnectionManager {
    provider: Arc<dyn SessionProvider>,
    socket: Arc<dyn SocketConnection>,
    auth_request: AuthenticateRequest,
    lifecycle: ExclusiveTaskQueue,
    slot: Mutex<SessionSlot>,
    state: watch::Sender<ConnectionState>,
}

impl SessionConnectionManager {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        socket: Arc<dyn SocketConnection>,
        auth_request: AuthenticateRequest,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            provider,
            socket,
            auth_request,
            lifecycle: ExclusiveTaskQueue::new(),
            slot: Mutex::new(SessionSlot::default()),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.slot.lock().await.session.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == ConnectionState::Active && !self.socket.is_connected()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "session: state changed");
        }
    }

    /// A socket failure leaves the session usable in pull-only mode.
    pub async fn start_session(&self) -> SyncResult<Session> {
        self.lifecycle
            .run_exclusive(|| async {
                if self.state() == ConnectionState::Expired {
                    return Err(SyncError::SessionExpired);
                }
                let (session, token) = self.authenticate_locked().await?;
                self.connect_socket_locked(&token).await;
                Ok(session)
            })
            .await
    }

    // The socket is authorized by the session token; it goes first.
    pub async fn end_session(&self) -> SyncResult<()> {
        self.lifecycle
            .run_exclusive(|| async { self.end_session_locked().await })
            .await
    }

    pub async fn restart_session(&self) -> SyncResult<Session> {
        self.lifecycle
            .run_exclusive(|| async {
                if self.socket.has_socket() {
                    self.socket.disconnect().await.map_err(SyncError::transport)?;
                }
                let (session, token) = self.authenticate_locked().await?;
                self.connect_socket_locked(&token).await;
                info!(session_id = %session.session_id, "session: restarted");
                Ok(session)
            })
            .await
    }

    pub async fn ensure_session_and_socket(&self) -> SyncResult<Session> {
        self.lifecycle
            .run_exclusive(|| async {
                let (session, token) = self.ensure_session_locked().await?;
                if !self.socket.is_connected() {
                    self.connect_socket_locked(&token).await;
                }
                Ok(session)
            })
            .await
    }

    pub async fn get_valid_token(&self) -> SyncResult<String> {
        self.provider
            .valid_token()
            .await
            .map_err(SyncError::transport)
    }

    pub async fn mark_expired(&self) {
        self.lifecycle
            .run_exclusive(|| async {
                if self.state() == ConnectionState::Active {
                    warn!("session: expired by remote signal");
                    self.transition(ConnectionState::Expired);
                }
            })
            .await
    }

    async fn authenticate_locked(&self) -> SyncResult<(Session, String)> {
        let previous = self.state();
        self.transition(ConnectionState::Connecting);

        let response = match self.provider.authenticate(&self.auth_request).await {
            Ok(response) => response,
            Err(err) => {
                self.transition(if previous == ConnectionState::Expired {
                    ConnectionState::Expired
                } else {
                    ConnectionState::Disconnected
                });
                return Err(SyncError::transport(err));
            }
        };

        {
            let mut slot = self.slot.lock().await;
            slot.session = Some(response.session.clone());
            slot.token = Some(response.token.clone());
        }
        self.transition(ConnectionState::Active);
        info!(
            session_id = %response.session.session_id,
            profile_id = %response.session.profile_id,
            "session: authenticated"
        );
        Ok((response.session, response.token))
    }

    async fn ensure_session_locked(&self) -> SyncResult<(Session, String)> {
        if self.state() == ConnectionState::Expired {
            return Err(SyncError::SessionExpired);
        }

        let existing = {
            let slot = self.slot.lock().await;
            slot.session.clone().zip(slot.token.clone())
        };
        let Some((session, token)) = existing else {
            return self.authenticate_locked().await;
        };

        match self
            .provider
            .validate(&token)
            .await
            .map_err(SyncError::transport)?
        {
            SessionValidity::Valid => Ok((session, token)),
            SessionValidity::Expired => {
                warn!(session_id = %session.session_id, "session: provider reports expiry");
                self.transition(ConnectionState::Expired);
                Err(SyncError::SessionExpired)
            }
        }
    }

    async fn connect_socket_locked(&self, token: &str) {
        match self.socket.connect(token).await {
            Ok(true) => info!("session: socket connected"),
            Ok(false) => warn!("session: socket declined connection; continuing pull-only"),
            Err(err) => warn!("session: socket connect failed; continuing pull-only: {err:#}"),
        }
    }

    async fn end_session_locked(&self) -> SyncResult<()> {
        let previous = self.state();
        self.transition(ConnectionState::Disconnecting);

        if self.socket.has_socket() {
            if let Err(err) = self.socket.disconnect().await {
                self.transition(previous);
                return Err(SyncError::transport(err));
            }
        }

        let token = self.slot.lock().await.token.clone();
        if let Some(token) = token {
            if let Err(err) = self.provider.end_session(&token).await {
                self.transition(previous);
                return Err(SyncError::transport(err));
            }
        }

        *self.slot.lock().await = SessionSlot::default();
        self.transition(ConnectionState::Disconnected);
        info!("session: ended");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
