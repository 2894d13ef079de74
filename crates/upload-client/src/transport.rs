//! The four protocol operations as seen from the client.

use chunkline_protocol::{
    ArtifactDescriptor, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};
use futures_util::future::BoxFuture;

use crate::error::ClientError;

/// Carries protocol requests to an upload server.
///
/// Remote failures come back as [`ClientError::Remote`] so the orchestrator
/// can classify them; connection failures as the other variants.
pub trait UploadTransport: Send + Sync {
    fn upload_chunk(
        &self,
        req: UploadChunkRequest,
    ) -> BoxFuture<'_, Result<UploadChunkResponse, ClientError>>;

    fn complete<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<ArtifactDescriptor, ClientError>>;

    fn status<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<UploadStatusResponse, ClientError>>;

    fn cancel<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), ClientError>>;
}
