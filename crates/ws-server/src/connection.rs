//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use chunkline_protocol::constants::{
    MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use chunkline_protocol::envelope::Message;
use chunkline_protocol::frame::{parse_chunk_frame, peek_frame_id};
use chunkline_protocol::{ErrorBody, ErrorKind};
use chunkline_upload_server::CallerIdentity;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Metadata about a connected client.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub connection_id: String,
    pub remote_addr: String,
}

/// Handle for sending messages to a connected client.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the client disconnected.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, body: ErrorBody) -> Result<(), SendError> {
        self.send_msg(req.reply_error(body))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to one client.
pub struct ClientConnection {
    pub meta: ConnectionMeta,
    sender: Sender,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals both pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected() && !self.cancel.is_cancelled()
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the connection handle together with the read task, which
/// finishes once the client is gone and the handler's disconnect hook ran.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ConnectionMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> (ClientConnection, JoinHandle<()>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let conn = ClientConnection {
        meta: meta.clone(),
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_handle = tokio::spawn(async move {
        read_pump(ws_stream, sender, Arc::clone(&handler), cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();
        handler.on_disconnected(&meta).await;
        tracing::info!(connection = %meta.connection_id, remote = %meta.remote_addr, "client disconnected");
    });

    (conn, read_handle)
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches them to the handler.
///
/// `hello` is handled inline so the identity is bound before any later
/// frame is looked at. Every other request runs in its own task, which
/// lets a client keep several chunk writes in flight on one connection.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;
    let mut caller: Option<CallerIdentity> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(&handler, &sender, &mut caller, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                if data.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_binary(&handler, &sender, caller.as_ref(), &data);
                            }
                            WsMessage::Pong(_) => {
                                got_pong = true;
                                pong_deadline.reset();
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::info!("received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

fn not_authenticated() -> ErrorBody {
    ErrorBody::new(ErrorKind::Forbidden, "hello handshake required")
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    caller: &mut Option<CallerIdentity>,
    text: &str,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    match msg.msg_type {
        MessageType::Hello => {
            if caller.is_some() {
                let _ = sender.send_error(
                    &msg,
                    ErrorBody::new(ErrorKind::InvalidArgument, "connection already authenticated"),
                );
                return;
            }
            *caller = handler.on_hello(sender.clone(), msg).await;
        }
        MessageType::Ping => handler.on_ping(sender.clone(), msg).await,
        _ => {
            let Some(identity) = caller.clone() else {
                let _ = sender.send_error(&msg, not_authenticated());
                return;
            };
            let handler = Arc::clone(handler);
            let s = sender.clone();
            tokio::spawn(async move {
                match msg.msg_type {
                    MessageType::CompleteUpload => {
                        handler.on_complete_upload(s, identity, msg).await
                    }
                    MessageType::UploadStatus => handler.on_upload_status(s, identity, msg).await,
                    MessageType::CancelUpload => handler.on_cancel_upload(s, identity, msg).await,
                    _ => handler.on_unknown(s, msg).await,
                }
            });
        }
    }
}

/// Dispatches a binary chunk frame to the handler in its own task.
fn dispatch_binary<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    caller: Option<&CallerIdentity>,
    data: &[u8],
) {
    let Some(identity) = caller.cloned() else {
        if let Some(id) = peek_frame_id(data) {
            let _ = sender.send_msg(Message::error(id, not_authenticated()));
        }
        return;
    };

    match parse_chunk_frame(data) {
        Ok((header, payload)) => {
            let handler = Arc::clone(handler);
            let s = sender.clone();
            tokio::spawn(async move {
                handler.on_binary_chunk(s, identity, header, payload).await;
            });
        }
        Err(e) => {
            tracing::error!("failed to parse chunk frame: {e}");
            if let Some(id) = peek_frame_id(data) {
                let _ = sender.send_msg(Message::error(
                    id,
                    ErrorBody::new(ErrorKind::InvalidArgument, e.to_string()),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender { tx };
        assert!(sender.is_connected());
        drop(rx);
        assert!(!sender.is_connected());
        let msg = Message::new("m1", MessageType::Pong, Option::<&()>::None).unwrap();
        assert!(sender.send_msg(msg).is_err());
    }
}
