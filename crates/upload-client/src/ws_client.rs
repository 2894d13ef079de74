//! WebSocket client and the [`UploadTransport`] built on it.
//!
//! Implements request-response with UUID correlation, binary chunk frames
//! and keepalive pings on idle connections. [`WsTransport`] reconnects
//! lazily: a request after a dropped connection dials again and repeats
//! the handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chunkline_protocol::constants::{
    MessageType, PROTOCOL_VERSION, WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE,
    WS_REQUEST_TIMEOUT,
};
use chunkline_protocol::envelope::Message;
use chunkline_protocol::frame::encode_chunk_frame;
use chunkline_protocol::messages::{
    CancelUploadRequest, CancelUploadResponse, CompleteUploadRequest, HelloRequest,
    UploadStatusRequest, WelcomeResponse,
};
use chunkline_protocol::{
    ArtifactDescriptor, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};

use crate::error::ClientError;
use crate::pumps::read::PendingMap;
use crate::transport::UploadTransport;

/// Send queue capacity per connection.
const WRITE_BUFFER_SIZE: usize = 256;

/// An authenticated WebSocket connection to an upload server.
pub struct WsClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    welcome: WelcomeResponse,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl WsClient {
    /// Connects to `url` and performs the `hello` handshake.
    pub async fn connect(url: &str, hello: &HelloRequest) -> Result<Self, ClientError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_BUFFER_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));

        let mut client = Self {
            write_tx,
            pending,
            welcome: WelcomeResponse {
                identity: String::new(),
                protocol_version: PROTOCOL_VERSION,
                server_name: String::new(),
                max_chunk_size: 0,
            },
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
        };

        let resp = client
            .send_request(MessageType::Hello, Some(hello))
            .await
            .map_err(|e| match e {
                // A dropped or silent connection stays retryable.
                ClientError::Remote { .. }
                | ClientError::Closed
                | ClientError::Timeout
                | ClientError::Ws(_) => e,
                other => ClientError::Handshake(other.to_string()),
            })?;
        if resp.msg_type != MessageType::Welcome {
            return Err(ClientError::Handshake(format!(
                "expected welcome, got {:?}",
                resp.msg_type
            )));
        }
        client.welcome = expect_payload(resp)?;
        tracing::debug!(
            identity = %client.welcome.identity,
            server = %client.welcome.server_name,
            "connected to upload server"
        );
        Ok(client)
    }

    /// The server's answer to the handshake.
    pub fn welcome(&self) -> &WelcomeResponse {
        &self.welcome
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.write_tx.is_closed()
    }

    /// Sends a request and waits for the response.
    ///
    /// An `error` response becomes [`ClientError::Remote`].
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.round_trip(id, tungstenite::Message::Text(json.into()), WS_REQUEST_TIMEOUT)
            .await
    }

    /// Sends one chunk as a binary frame and waits for its acknowledgement.
    pub async fn send_chunk(
        &self,
        req: UploadChunkRequest,
    ) -> Result<UploadChunkResponse, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (header, payload) = req.into_frame_parts(&id);
        let frame = encode_chunk_frame(&header, &payload)?;
        drop(payload);
        let resp = self
            .round_trip(
                id,
                tungstenite::Message::Binary(frame.into()),
                WS_BINARY_REQUEST_TIMEOUT,
            )
            .await?;
        expect_payload(resp)
    }

    async fn round_trip(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            // The read pump cancels before it drains `pending`; an entry
            // added after the drain would never be answered.
            let mut pending = self.pending.lock().await;
            if self.cancel.is_cancelled() {
                return Err(ClientError::Closed);
            }
            pending.insert(id.clone(), tx);
        }

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => match resp.error {
                Some(body) => Err(ClientError::from_body(body)),
                None => Ok(resp),
            },
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        let _ = self
            .write_tx
            .send(tungstenite::Message::Close(None))
            .await;
        self.cancel.cancel();
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}

fn expect_payload<T: DeserializeOwned>(msg: Message) -> Result<T, ClientError> {
    msg.parse_payload()?
        .ok_or_else(|| ClientError::Protocol(format!("{:?} without payload", msg.msg_type)))
}

/// [`UploadTransport`] over a lazily (re)connected [`WsClient`].
pub struct WsTransport {
    url: String,
    hello: HelloRequest,
    client: Mutex<Option<Arc<WsClient>>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, token: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hello: HelloRequest {
                token: token.into(),
                protocol_version: PROTOCOL_VERSION,
                client_name: client_name.into(),
            },
            client: Mutex::new(None),
        }
    }

    /// Connects now (if not connected) and returns the handshake answer.
    pub async fn connect(&self) -> Result<WelcomeResponse, ClientError> {
        Ok(self.client().await?.welcome().clone())
    }

    /// Closes the current connection, if any.
    pub async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
    }

    async fn client(&self) -> Result<Arc<WsClient>, ClientError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref().filter(|c| c.is_connected()) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(WsClient::connect(&self.url, &self.hello).await?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Forgets `client` after a connection-level failure so the next call
    /// dials again.
    async fn drop_if_broken(&self, client: &Arc<WsClient>, err: &ClientError) {
        if matches!(err, ClientError::Closed | ClientError::Ws(_)) {
            let mut slot = self.client.lock().await;
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, client)) {
                tracing::debug!("dropping broken connection: {err}");
                *slot = None;
            }
        }
    }

    async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        req: &Req,
    ) -> Result<Resp, ClientError> {
        let client = self.client().await?;
        match client.send_request(msg_type, Some(req)).await {
            Ok(resp) => expect_payload(resp),
            Err(e) => {
                self.drop_if_broken(&client, &e).await;
                Err(e)
            }
        }
    }
}

impl UploadTransport for WsTransport {
    fn upload_chunk(
        &self,
        req: UploadChunkRequest,
    ) -> BoxFuture<'_, Result<UploadChunkResponse, ClientError>> {
        Box::pin(async move {
            let client = self.client().await?;
            let result = client.send_chunk(req).await;
            if let Err(e) = &result {
                self.drop_if_broken(&client, e).await;
            }
            result
        })
    }

    fn complete<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<ArtifactDescriptor, ClientError>> {
        Box::pin(async move {
            let req = CompleteUploadRequest {
                upload_id: upload_id.to_string(),
            };
            self.request(MessageType::CompleteUpload, &req).await
        })
    }

    fn status<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<UploadStatusResponse, ClientError>> {
        Box::pin(async move {
            let req = UploadStatusRequest {
                upload_id: upload_id.to_string(),
            };
            self.request(MessageType::UploadStatus, &req).await
        })
    }

    fn cancel<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            let req = CancelUploadRequest {
                upload_id: upload_id.to_string(),
            };
            let resp: CancelUploadResponse = self.request(MessageType::CancelUpload, &req).await?;
            if resp.success {
                Ok(())
            } else {
                Err(ClientError::Protocol("server did not confirm cancellation".into()))
            }
        })
    }
}
