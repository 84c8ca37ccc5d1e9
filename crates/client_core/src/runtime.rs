use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use reqwest::Client;
use shared::{
    domain::{ConversationId, DeviceId, Message, Sequence, Session},
    protocol::{ClientFrame, ServerPush},
};
use storage::Storage;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
    pager::{ConversationHistoryPager, HistoryClient},
    reconciliation::{EventReconciliationStore, StoreMode},
    session::{ConnectionState, SessionConnectionManager, SessionProvider, SocketConnection},
    transport::{HttpHistoryClient, HttpSessionProvider, WsSocket},
    ClientEvent,
};

pub struct RuntimeParts {
    pub provider: Arc<dyn SessionProvider>,
    pub socket: Arc<dyn SocketConnection>,
    pub history: Arc<dyn HistoryClient>,
    pub store: Arc<EventReconciliationStore>,
    /// Closed on shutdown when present.
    pub storage: Option<Storage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStatus {
    pub conversation_id: ConversationId,
    pub token: Option<Sequence>,
    pub pending: Vec<Sequence>,
    pub mode: Option<StoreMode>,
}

pub struct SyncRuntime {
    settings: ClientSettings,
    store: Arc<EventReconciliationStore>,
    session: Arc<SessionConnectionManager>,
    socket: Arc<dyn SocketConnection>,
    pager: Arc<ConversationHistoryPager>,
    storage: Option<Storage>,
    purge_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncRuntime {
    /// Wires the default HTTP, WebSocket and SQLite collaborators.
    pub async fn from_settings(settings: ClientSettings) -> anyhow::Result<Arc<Self>> {
        let http = Client::builder()
            .build()
            .context("failed to build http client")?;
        let provider: Arc<dyn SessionProvider> = Arc::new(HttpSessionProvider::new(
            http.clone(),
            settings.server_url.clone(),
        ));
        let history = Arc::new(HttpHistoryClient::new(
            http,
            settings.server_url.clone(),
            Arc::clone(&provider),
        ));
        let socket = Arc::new(WsSocket::new(settings.server_url.clone()));
        let pushes = socket.subscribe_pushes();

        let (store, storage) = match settings.storage_url.as_deref() {
            Some(url) => {
                let storage = Storage::new_lazy(url)
                    .with_context(|| format!("invalid storage url '{url}'"))?;
                let store = EventReconciliationStore::new(Arc::new(storage.clone()));
                (Arc::new(store), Some(storage))
            }
            None => (
                Arc::new(EventReconciliationStore::without_durable_storage(
                    "no storage url configured",
                )),
                None,
            ),
        };

        let runtime = Self::new(
            settings,
            RuntimeParts {
                provider,
                socket,
                history,
                store,
                storage,
            },
        );
        runtime.spawn_push_router(pushes).await;
        Ok(runtime)
    }

    pub fn new(settings: ClientSettings, parts: RuntimeParts) -> Arc<Self> {
        let device_id = match settings.device_id.as_deref() {
            Some(device_id) => DeviceId::from(device_id),
            None => {
                let generated = DeviceId::generate();
                info!(device_id = %generated, "sync: no device id configured; generated one");
                generated
            }
        };
        let session = Arc::new(SessionConnectionManager::new(
            parts.provider,
            Arc::clone(&parts.socket),
            settings.auth_request(device_id),
        ));
        let pager = Arc::new(ConversationHistoryPager::new(
            Arc::clone(&parts.store),
            parts.history,
            settings.page_size,
            settings.gap_policy,
        ));

        Arc::new(Self {
            settings,
            store: parts.store,
            session,
            socket: parts.socket,
            pager,
            storage: parts.storage,
            purge_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &Arc<SessionConnectionManager> {
        &self.session
    }

    pub fn pager(&self) -> &Arc<ConversationHistoryPager> {
        &self.pager
    }

    pub fn store(&self) -> &Arc<EventReconciliationStore> {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.pager.subscribe_events()
    }

    pub async fn start(&self) -> SyncResult<Session> {
        self.open_store().await?;
        let session = self.session.ensure_session_and_socket().await?;
        if !self.purge_started.swap(true, Ordering::SeqCst) {
            let handle = self.store.spawn_purge_task(
                self.settings.purge_interval(),
                self.settings.orphan_retention(),
            );
            self.tasks.lock().await.push(handle);
        }
        Ok(session)
    }

    /// Store initialization alone, for work that needs no session.
    pub async fn open_store(&self) -> SyncResult<StoreMode> {
        match self.store.initialize().await {
            Ok(mode) => Ok(mode),
            Err(SyncError::UnsupportedPlatform(reason)) => {
                warn!(%reason, "sync: running without durable storage");
                Ok(StoreMode::Volatile)
            }
            Err(err) => Err(err),
        }
    }

    /// Routes decoded push frames into the pager until the sender closes.
    pub async fn spawn_push_router(&self, mut pushes: broadcast::Receiver<ServerPush>) {
        let pager = Arc::clone(&self.pager);
        let session = Arc::clone(&self.session);
        let events = self.pager.event_sender();
        let handle = tokio::spawn(async move {
            loop {
                match pushes.recv().await {
                    Ok(push) => route_push(&pager, &session, &events, push).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: push router lagged; next pull cycle catches up");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("sync: push router stopped");
        });
        self.tasks.lock().await.push(handle);
    }

    fn require_session(&self) -> SyncResult<()> {
        match self.session.state() {
            ConnectionState::Active => Ok(()),
            ConnectionState::Expired => Err(SyncError::SessionExpired),
            _ => Err(SyncError::NotConnected),
        }
    }

    pub async fn sync(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>> {
        self.require_session()?;
        self.pager.fetch_next_page(conversation_id).await
    }

    pub async fn load_older(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>> {
        self.require_session()?;
        self.pager.load_older(conversation_id).await
    }

    pub async fn subscribe(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        self.require_session()?;
        if !self.socket.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.socket
            .send(ClientFrame::Subscribe {
                conversation_id: conversation_id.clone(),
            })
            .await
            .map_err(SyncError::transport)
    }

    pub async fn status(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<ConversationStatus> {
        let token = self.store.get_continuation_token(conversation_id).await?;
        let pending = self
            .store
            .get_orphaned_events(conversation_id)
            .await?
            .into_iter()
            .map(|event| event.sequence)
            .collect();
        Ok(ConversationStatus {
            conversation_id: conversation_id.clone(),
            token,
            pending,
            mode: self.store.mode(),
        })
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.purge_started.store(false, Ordering::SeqCst);

        let ended = if self.session.current_session().await.is_some() {
            self.session.end_session().await
        } else {
            Ok(())
        };
        if let Some(storage) = &self.storage {
            storage.close().await;
        }
        info!("sync: runtime shut down");
        ended
    }
}

async fn route_push(
    pager: &ConversationHistoryPager,
    session: &SessionConnectionManager,
    events: &broadcast::Sender<ClientEvent>,
    push: ServerPush,
) {
    match push {
        ServerPush::ConversationEvent { event } => {
            let conversation_id = event.conversation_id.clone();
            let outcome = match pager.ingest_push_event(&event).await {
                Ok(true) => pager.apply_buffered(&conversation_id).await.map(|_| ()),
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                warn!(
                    conversation_id = %conversation_id,
                    sequence = event.sequence,
                    "sync: push event not applied: {err}"
                );
                let _ = events.send(ClientEvent::Error(err.to_string()));
            }
        }
        ServerPush::SessionExpired => {
            session.mark_expired().await;
            let _ = events.send(ClientEvent::SessionExpired);
        }
        ServerPush::Pong => debug!("sync: pong"),
        ServerPush::Error(api_error) => {
            warn!(code = ?api_error.code, "sync: server reported error: {}", api_error.message);
            let _ = events.send(ClientEvent::Error(format!(
                "{:?}: {}",
                api_error.code, api_error.message
            )));
        }
    }
}
