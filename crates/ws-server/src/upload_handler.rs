//! [`Handler`] backed by the upload service.

use std::sync::Arc;

use chunkline_protocol::constants::PROTOCOL_VERSION;
use chunkline_protocol::envelope::Message;
use chunkline_protocol::messages::{
    CancelUploadRequest, CancelUploadResponse, ChunkFrameHeader, CompleteUploadRequest,
    HelloRequest, UploadStatusRequest, WelcomeResponse,
};
use chunkline_protocol::{ErrorBody, ErrorKind, MessageType, UploadChunkRequest};
use chunkline_upload_server::{CallerIdentity, IdentityProvider, UploadError, UploadService};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};

/// Routes WebSocket requests to an [`UploadService`].
pub struct UploadHandler {
    service: UploadService,
    identity: Arc<dyn IdentityProvider>,
    server_name: String,
}

impl UploadHandler {
    pub fn new(
        service: UploadService,
        identity: Arc<dyn IdentityProvider>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            service,
            identity,
            server_name: server_name.into(),
        }
    }
}

fn parse_request<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload() {
        Ok(Some(req)) => Some(req),
        _ => {
            let _ = sender.send_error(
                msg,
                ErrorBody::new(ErrorKind::InvalidArgument, "invalid payload"),
            );
            None
        }
    }
}

fn send_reply<T: Serialize>(sender: &Sender, msg: &Message, msg_type: MessageType, payload: &T) {
    match msg.reply(msg_type, Some(payload)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => tracing::error!(id = %msg.id, "failed to encode reply: {e}"),
    }
}

fn send_upload_error(sender: &Sender, id: &str, err: &UploadError) {
    match err {
        UploadError::Storage(e) => tracing::error!(id, "storage failure: {e}"),
        _ => tracing::debug!(id, kind = %err.kind(), "request failed: {err}"),
    }
    let _ = sender.send_msg(Message::error(id, err.to_error_body()));
}

impl Handler for UploadHandler {
    fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_, Option<CallerIdentity>> {
        Box::pin(async move {
            let req: HelloRequest = parse_request(&sender, &msg)?;

            if req.protocol_version != PROTOCOL_VERSION {
                let _ = sender.send_error(
                    &msg,
                    ErrorBody::new(
                        ErrorKind::InvalidArgument,
                        format!(
                            "unsupported protocol version {} (server speaks {PROTOCOL_VERSION})",
                            req.protocol_version
                        ),
                    ),
                );
                return None;
            }

            let Some(identity) = self.identity.authenticate(&req.token).await else {
                tracing::warn!(client = %req.client_name, "rejected hello: unknown token");
                let _ = sender.send_error(
                    &msg,
                    ErrorBody::new(ErrorKind::Forbidden, "invalid token"),
                );
                return None;
            };

            tracing::info!(identity = %identity, client = %req.client_name, "client authenticated");
            let welcome = WelcomeResponse {
                identity: identity.to_string(),
                protocol_version: PROTOCOL_VERSION,
                server_name: self.server_name.clone(),
                max_chunk_size: self.service.store().config().max_chunk_size,
            };
            send_reply(&sender, &msg, MessageType::Welcome, &welcome);
            Some(identity)
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        header: ChunkFrameHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let id = header.id.clone();
            let req = UploadChunkRequest::from_frame_parts(header, data);
            match self.service.upload_chunk(req, &caller).await {
                Ok(resp) => match Message::new(&id, MessageType::UploadChunkResponse, Some(&resp)) {
                    Ok(reply) => {
                        let _ = sender.send_msg(reply);
                    }
                    Err(e) => tracing::error!(id = %id, "failed to encode reply: {e}"),
                },
                Err(e) => send_upload_error(&sender, &id, &e),
            }
        })
    }

    fn on_complete_upload(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        msg: Message,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<CompleteUploadRequest>(&sender, &msg) else {
                return;
            };
            match self.service.complete(&req.upload_id, &caller).await {
                Ok(artifact) => {
                    send_reply(&sender, &msg, MessageType::CompleteUploadResponse, &artifact)
                }
                Err(e) => send_upload_error(&sender, &msg.id, &e),
            }
        })
    }

    fn on_upload_status(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        msg: Message,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<UploadStatusRequest>(&sender, &msg) else {
                return;
            };
            match self.service.status(&req.upload_id, &caller) {
                Ok(status) => {
                    send_reply(&sender, &msg, MessageType::UploadStatusResponse, &status)
                }
                Err(e) => send_upload_error(&sender, &msg.id, &e),
            }
        })
    }

    fn on_cancel_upload(
        &self,
        sender: Sender,
        caller: CallerIdentity,
        msg: Message,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<CancelUploadRequest>(&sender, &msg) else {
                return;
            };
            match self.service.cancel(&req.upload_id, &caller).await {
                Ok(()) => send_reply(
                    &sender,
                    &msg,
                    MessageType::CancelUploadResponse,
                    &CancelUploadResponse { success: true },
                ),
                Err(e) => send_upload_error(&sender, &msg.id, &e),
            }
        })
    }
}
