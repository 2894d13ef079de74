//! Resume reconciliation: server status decides what still has to be sent.

use std::collections::BTreeSet;

use chunkline_protocol::SessionState;

use crate::error::ClientError;
use crate::task::UploadTask;
use crate::transport::UploadTransport;

/// What a resumed run has to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Chunks the server does not hold, ascending.
    pub missing: Vec<u32>,
    /// Server-side session state; `None` when no session exists yet.
    pub server_state: Option<SessionState>,
}

/// Re-derives chunk states of `task` from the server's status.
///
/// Chunks the server holds become `Acked`, all others `Pending` with a
/// fresh retry budget, whatever the client believed before. A task that
/// never got a session reconciles to everything pending.
pub async fn reconcile(
    task: &UploadTask,
    transport: &dyn UploadTransport,
) -> Result<ReconcilePlan, ClientError> {
    let Some(upload_id) = task.upload_id() else {
        let missing = task.apply_server_view(&BTreeSet::new());
        return Ok(ReconcilePlan {
            missing,
            server_state: None,
        });
    };

    let status = transport.status(&upload_id).await?;
    let local = task.layout().total_chunks();
    if status.total_chunks != local {
        return Err(ClientError::LayoutMismatch {
            local,
            server: status.total_chunks,
        });
    }

    let received: BTreeSet<u32> = if status.state == SessionState::Completed {
        (0..local).collect()
    } else {
        status
            .received_chunks
            .iter()
            .copied()
            .filter(|&i| i < local)
            .collect()
    };
    let missing = task.apply_server_view(&received);

    tracing::debug!(
        file_id = %task.file_id(),
        upload_id = %upload_id,
        received = received.len(),
        missing = missing.len(),
        "reconciled with server status"
    );

    Ok(ReconcilePlan {
        missing,
        server_state: Some(status.state),
    })
}
