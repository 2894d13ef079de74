//! WebSocket write pump: the only writer on a client connection.
//!
//! It also keeps an idle connection alive. A ping goes out only after
//! [`WS_PING_PERIOD`] without any outbound frame, so a stream of chunk
//! frames is never interleaved with keepalive traffic.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use chunkline_protocol::constants::{WS_BINARY_REQUEST_TIMEOUT, WS_PING_PERIOD, WS_WRITE_WAIT};

/// Drains `write_rx` into the socket until cancelled, the queue closes or
/// a write fails or stalls. Cancels `cancel` on the way out so the read
/// pump fails every pending request.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let keepalive = tokio::time::sleep(WS_PING_PERIOD);
    tokio::pin!(keepalive);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut keepalive => {
                trace!("connection idle, sending ping");
                tungstenite::Message::Ping(Vec::new().into())
            }
            msg = write_rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        let wait = write_wait(&msg);
        match tokio::time::timeout(wait, write.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("WebSocket write error: {e}");
                break;
            }
            Err(_) => {
                error!(wait_secs = wait.as_secs(), "WebSocket write stalled");
                break;
            }
        }
        keepalive.as_mut().reset(Instant::now() + WS_PING_PERIOD);
    }

    cancel.cancel();
    let _ = tokio::time::timeout(WS_WRITE_WAIT, write.send(tungstenite::Message::Close(None))).await;
}

/// A chunk frame may take as long as the request it carries.
fn write_wait(msg: &tungstenite::Message) -> Duration {
    match msg {
        tungstenite::Message::Binary(_) => WS_BINARY_REQUEST_TIMEOUT,
        _ => WS_WRITE_WAIT,
    }
}
