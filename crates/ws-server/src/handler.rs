//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload logic while the server framework
//! handles connection management, the identity handshake, routing and the
//! binary chunk frames.

use std::future::Future;
use std::pin::Pin;

use chunkline_protocol::envelope::Message;
use chunkline_protocol::messages::ChunkFrameHeader;
use chunkline_protocol::{ErrorBody, ErrorKind, MessageType};
use chunkline_upload_server::CallerIdentity;

use crate::connection::{ConnectionMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a, T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handling messages from upload clients.
///
/// Every method except [`on_hello`](Handler::on_hello) runs only after the
/// connection completed the handshake and receives the identity it was
/// bound to. Requests are dispatched concurrently, so implementations must
/// not assume any ordering between them.
pub trait Handler: Send + Sync + 'static {
    /// Called for `hello`. Replies `welcome` and returns the caller
    /// identity on success; replies with an error and returns `None`
    /// otherwise.
    fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_, Option<CallerIdentity>>;

    /// Called for a binary chunk frame.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        header: ChunkFrameHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_>;

    /// Called for `complete_upload`.
    fn on_complete_upload(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        msg: Message,
    ) -> HandlerFuture<'_>;

    /// Called for `upload_status`.
    fn on_upload_status(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        msg: Message,
    ) -> HandlerFuture<'_>;

    /// Called for `cancel_upload`.
    fn on_cancel_upload(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        msg: Message,
    ) -> HandlerFuture<'_>;

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for message types this handler does not know.
    fn on_unknown(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(
                &msg,
                ErrorBody::new(ErrorKind::InvalidArgument, "unknown message type"),
            );
        })
    }

    /// Called when a client disconnects (cleanup hook).
    fn on_disconnected(&self, meta: &ConnectionMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }
}
