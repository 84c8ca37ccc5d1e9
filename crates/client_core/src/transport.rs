use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{ConversationId, Sequence},
    error::{ApiError, ApiException},
    protocol::{
        AuthenticateRequest, AuthenticateResponse, ClientFrame, HistoryPage, HistoryPageQuery,
        ServerPush, SessionValidity, ValidateSessionResponse,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    pager::HistoryClient,
    session::{SessionProvider, SocketConnection},
};

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) => Err(anyhow!("request failed with status {status}: {body}")),
    }
}

pub struct HttpSessionProvider {
    http: Client,
    server_url: String,
    token: Mutex<Option<String>>,
}

impl HttpSessionProvider {
    pub fn new(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn authenticate(&self, request: &AuthenticateRequest) -> Result<AuthenticateResponse> {
        let response = self
            .http
            .post(format!("{}/sessions", self.server_url))
            .json(request)
            .send()
            .await
            .context("failed to reach session endpoint")?;
        let body: AuthenticateResponse = ensure_success(response).await?.json().await?;
        *self.token.lock().await = Some(body.token.clone());
        Ok(body)
    }

    async fn validate(&self, token: &str) -> Result<SessionValidity> {
        let response = self
            .http
            .get(format!("{}/sessions/current", self.server_url))
            .bearer_auth(token)
            .send()
            .await
            .context("failed to reach session endpoint")?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(SessionValidity::Expired);
        }
        let body: ValidateSessionResponse = ensure_success(response).await?.json().await?;
        Ok(body.validity)
    }

    async fn end_session(&self, token: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/sessions/current", self.server_url))
            .bearer_auth(token)
            .send()
            .await
            .context("failed to reach session endpoint")?;
        ensure_success(response).await?;
        let mut current = self.token.lock().await;
        if current.as_deref() == Some(token) {
            *current = None;
        }
        Ok(())
    }

    async fn valid_token(&self) -> Result<String> {
        self.token
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("not authenticated: no session token"))
    }
}

pub struct HttpHistoryClient {
    http: Client,
    server_url: String,
    tokens: Arc<dyn SessionProvider>,
}

impl HttpHistoryClient {
    pub fn new(
        http: Client,
        server_url: impl Into<String>,
        tokens: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }
}

#[async_trait]
impl HistoryClient for HttpHistoryClient {
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        page_size: u32,
        before: Option<Sequence>,
    ) -> Result<HistoryPage> {
        let token = self.tokens.valid_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/history",
                self.server_url, conversation_id
            ))
            .bearer_auth(token)
            .query(&HistoryPageQuery { page_size, before })
            .send()
            .await
            .with_context(|| format!("failed to fetch history for {conversation_id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(anyhow!("conversation {conversation_id} not found"));
        }
        Ok(ensure_success(response).await?.json().await?)
    }
}

struct WsConnection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct WsSocket {
    server_url: String,
    pushes: broadcast::Sender<ServerPush>,
    connection: Mutex<Option<WsConnection>>,
    attached: AtomicBool,
    connected: Arc<AtomicBool>,
}

impl WsSocket {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (pushes, _) = broadcast::channel(256);
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            pushes,
            connection: Mutex::new(None),
            attached: AtomicBool::new(false),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe_pushes(&self) -> broadcast::Receiver<ServerPush> {
        self.pushes.subscribe()
    }

    fn ws_url(&self, token: &str) -> Result<Url> {
        let ws_url = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&format!("{ws_url}/ws"))
            .with_context(|| format!("invalid websocket url derived from {}", self.server_url))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl SocketConnection for WsSocket {
    async fn connect(&self, token: &str) -> Result<bool> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(true);
        }
        if let Some(stale) = slot.take() {
            stale.reader.abort();
            stale.writer.abort();
        }

        let url = self.ws_url(token)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .context("failed to connect websocket")?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_writer.send(message).await {
                    warn!("socket: websocket send failed: {err}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pushes = self.pushes.clone();
        let connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerPush>(&text) {
                        Ok(push) => {
                            let _ = pushes.send(push);
                        }
                        Err(err) => warn!("socket: invalid server push: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("socket: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!("socket: reader finished");
        });

        self.connected.store(true, Ordering::SeqCst);
        self.attached.store(true, Ordering::SeqCst);
        *slot = Some(WsConnection {
            outbound,
            reader,
            writer,
        });
        info!(url = %self.server_url, "socket: connected");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(false);
        };
        let _ = connection.outbound.send(Message::Close(None));
        drop(connection.outbound);
        let _ = connection.writer.await;
        connection.reader.abort();
        self.connected.store(false, Ordering::SeqCst);
        self.attached.store(false, Ordering::SeqCst);
        info!("socket: disconnected");
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn has_socket(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: ClientFrame) -> Result<()> {
        let payload = serde_json::to_string(&frame).context("failed to encode client frame")?;
        let slot = self.connection.lock().await;
        let connection = slot
            .as_ref()
            .ok_or_else(|| anyhow!("socket is not connected"))?;
        connection
            .outbound
            .send(Message::Text(payload))
            .map_err(|_| anyhow!("socket writer has stopped"))
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
