//! Upload WebSocket server.
//!
//! Listens on a TCP address, upgrades each connection to WebSocket and
//! keeps one [`ClientConnection`] per client until it disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chunkline_protocol::constants::WS_MAX_MESSAGE_SIZE;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::connection::{self, ClientConnection, ConnectionMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind: SocketAddr,
    /// Connections beyond this limit are refused before the upgrade.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            max_connections: 256,
        }
    }
}

/// The upload WebSocket server.
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    connections: Mutex<HashMap<String, ClientConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    for (_, conn) in self.connections.lock().await.drain() {
                        conn.close();
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and tracks it until it closes.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        if self.connection_count().await >= self.config.max_connections {
            tracing::warn!(%peer_addr, "rejecting connection: limit reached");
            return Err(ServerError::TooManyConnections);
        }

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%peer_addr, connection = %connection_id, "WebSocket connection established");

        let meta = ConnectionMeta {
            connection_id: connection_id.clone(),
            remote_addr: peer_addr.to_string(),
        };
        let (conn, read_handle) = connection::spawn_connection(
            ws_stream,
            meta,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        self.connections
            .lock()
            .await
            .insert(connection_id.clone(), conn);

        let _ = read_handle.await;
        self.connections.lock().await.remove(&connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Sender;
    use crate::handler::HandlerFuture;
    use chunkline_protocol::MessageType;
    use chunkline_protocol::envelope::Message;
    use chunkline_protocol::messages::ChunkFrameHeader;
    use chunkline_upload_server::CallerIdentity;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Accepts any hello and counts status requests.
    #[derive(Default)]
    struct TestHandler {
        statuses: AtomicUsize,
    }

    impl Handler for TestHandler {
        fn on_hello(
            &self,
            sender: Sender,
            msg: Message,
        ) -> HandlerFuture<'_, Option<CallerIdentity>> {
            Box::pin(async move {
                let reply = msg.reply(MessageType::Welcome, Option::<&()>::None).unwrap();
                let _ = sender.send_msg(reply);
                Some(CallerIdentity::new("tester"))
            })
        }

        fn on_binary_chunk(
            &self,
            _sender: Sender,
            _caller: CallerIdentity,
            _header: ChunkFrameHeader,
            _data: Vec<u8>,
        ) -> HandlerFuture<'_> {
            Box::pin(async {})
        }

        fn on_complete_upload(
            &self,
            _sender: Sender,
            _caller: CallerIdentity,
            _msg: Message,
        ) -> HandlerFuture<'_> {
            Box::pin(async {})
        }

        fn on_upload_status(
            &self,
            _sender: Sender,
            _caller: CallerIdentity,
            _msg: Message,
        ) -> HandlerFuture<'_> {
            self.statuses.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_cancel_upload(
            &self,
            _sender: Sender,
            _caller: CallerIdentity,
            _msg: Message,
        ) -> HandlerFuture<'_> {
            Box::pin(async {})
        }
    }

    async fn start(
        config: ServerConfig,
    ) -> (Arc<UploadServer<TestHandler>>, tokio::task::JoinHandle<()>, SocketAddr) {
        let server = UploadServer::new(config, TestHandler::default());
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        let mut addr = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            addr = server.local_addr().await;
            if addr.is_some() {
                break;
            }
        }
        (server, handle, addr.unwrap())
    }

    fn text(value: serde_json::Value) -> WsMessage {
        WsMessage::Text(value.to_string().into())
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(t) => return serde_json::from_str(&t).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, addr) = start(ServerConfig::default()).await;
        assert!(addr.port() > 0);
        assert_eq!(server.connection_count().await, 0);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn tracks_and_forgets_connections() {
        let (server, handle, addr) = start(ServerConfig::default()).await;
        let url = format!("ws://{addr}");

        let (ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count().await, 2);

        drop(ws1);
        drop(ws2);
        let mut count = 2;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            count = server.connection_count().await;
            if count == 0 {
                break;
            }
        }
        assert_eq!(count, 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn requests_before_hello_are_forbidden() {
        let (server, handle, addr) = start(ServerConfig::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        ws.send(text(serde_json::json!({
            "id": "s1",
            "type": "upload_status",
            "payload": {"uploadId": "x"}
        })))
        .await
        .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["id"], "s1");
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"]["code"], 403);
        assert_eq!(server.handler.statuses.load(Ordering::SeqCst), 0);

        ws.send(text(serde_json::json!({
            "id": "h1",
            "type": "hello",
            "payload": {"token": "t", "protocolVersion": 1}
        })))
        .await
        .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "welcome");

        ws.send(text(serde_json::json!({
            "id": "s2",
            "type": "upload_status",
            "payload": {"uploadId": "x"}
        })))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.handler.statuses.load(Ordering::SeqCst), 1);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn refuses_connections_over_limit() {
        let (server, handle, addr) = start(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        })
        .await;
        let url = format!("ws://{addr}");

        let (_ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second socket is dropped before the upgrade completes.
        assert!(tokio_tungstenite::connect_async(&url).await.is_err());
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
        handle.await.unwrap();
    }
}
