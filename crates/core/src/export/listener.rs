//! Loopback endpoint for the TLS terminator.
//!
//! The terminator completes the mutual handshake, then forwards each request
//! as one JSON line `{"secret": "..", "peer": {..}, "request": {..}}` and
//! relays the JSON line that comes back. A line without the shared secret
//! did not come from the terminator, so its peer claim is never passed on.
//! The listener itself holds no export state; every request is answered by
//! the engine loop.

use std::{io, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{error::TransportError, session::SessionId};

use super::{ExportRequest, ExportResponse, PeerCertificate};

/// One request line as forwarded by the terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatedRequest {
    pub secret: String,
    pub peer: PeerCertificate,
    pub request: ExportRequest,
}

#[derive(Debug)]
pub struct ExportCall {
    pub peer: PeerCertificate,
    pub request: ExportRequest,
    pub reply: oneshot::Sender<ExportResponse>,
}

/// What the listener posts to the engine loop.
#[derive(Debug)]
pub enum ExportMessage {
    Call(ExportCall),
    /// A leased batch could not be written back to the poller.
    DeliveryFailed {
        session: SessionId,
        error: TransportError,
    },
}

pub async fn serve(
    listener: TcpListener,
    engine: mpsc::Sender<ExportMessage>,
    secret: String,
    cancel: CancellationToken,
) {
    let secret: Arc<str> = secret.into();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "export connection accepted");
                let engine = engine.clone();
                let secret = Arc::clone(&secret);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection(stream, engine, &secret, cancel).await {
                        tracing::warn!(%peer, error = %err, "export connection failed");
                    }
                });
            }
            Err(err) => tracing::warn!(error = %err, "failed to accept export connection"),
        }
    }
    tracing::debug!("export listener stopped");
}

async fn connection(
    stream: TcpStream,
    engine: mpsc::Sender<ExportMessage>,
    secret: &str,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let response = match serde_json::from_str::<TerminatedRequest>(&line) {
            Ok(terminated) if same_secret(&terminated.secret, secret) => {
                dispatch(&engine, terminated).await
            }
            Ok(terminated) => {
                tracing::warn!(subject = %terminated.peer.subject, "request did not come through the terminator");
                ExportResponse::Rejected {
                    reason: "unauthenticated terminator".into(),
                }
            }
            Err(err) => ExportResponse::Rejected {
                reason: format!("malformed request: {err}"),
            },
        };

        let mut body = serde_json::to_string(&response)?;
        body.push('\n');
        if let Err(err) = write.write_all(body.as_bytes()).await {
            if let ExportResponse::Batch(batch) = response {
                let failure = ExportMessage::DeliveryFailed {
                    session: batch.session,
                    error: TransportError::Delivery(err.to_string()),
                };
                let _ = engine.send(failure).await;
            }
            return Err(err);
        }
    }
}

/// Compares without stopping at the first differing byte.
fn same_secret(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

async fn dispatch(engine: &mpsc::Sender<ExportMessage>, terminated: TerminatedRequest) -> ExportResponse {
    let (reply, response) = oneshot::channel();
    let call = ExportCall {
        peer: terminated.peer,
        request: terminated.request,
        reply,
    };
    if engine.send(ExportMessage::Call(call)).await.is_err() {
        return ExportResponse::Rejected {
            reason: "engine is not running".into(),
        };
    }
    response.await.unwrap_or_else(|_| ExportResponse::Rejected {
        reason: "engine dropped the request".into(),
    })
}
