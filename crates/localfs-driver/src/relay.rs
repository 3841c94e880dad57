use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::control::{ControlClient, ControlError};

/// One upstream message, forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Why a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Caller dropped its receiver.
    DownstreamClosed,
    /// Endpoint closed the connection.
    UpstreamClosed,
    /// Transport error on the upstream side.
    UpstreamError,
}

/// Opens the resource stream for an instance and relays every message to
/// `sink` until either side goes away. The sink is dropped (closed) when the
/// relay ends.
pub async fn resources_stream(
    client: &ControlClient,
    control_port: u16,
    sink: mpsc::Sender<StreamMessage>,
) -> Result<JoinHandle<RelayEnd>, ControlError> {
    let url = client.url("ws", control_port, &["flowforge", "resources"])?;
    let path = url.path().to_string();
    client.count_call();
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|source| ControlError::Stream {
            path: path.clone(),
            source,
        })?;

    Ok(tokio::spawn(async move {
        let (mut upstream_tx, mut upstream_rx) = ws.split();
        let end = loop {
            tokio::select! {
                _ = sink.closed() => break RelayEnd::DownstreamClosed,
                msg = upstream_rx.next() => {
                    let out = match msg {
                        Some(Ok(WsMessage::Text(text))) => StreamMessage::Text(text.as_str().to_string()),
                        Some(Ok(WsMessage::Binary(bytes))) => StreamMessage::Binary(bytes.to_vec()),
                        Some(Ok(WsMessage::Close(_))) | None => break RelayEnd::UpstreamClosed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(path = %path, error = %e, "resource stream error");
                            break RelayEnd::UpstreamError;
                        }
                    };
                    if sink.send(out).await.is_err() {
                        break RelayEnd::DownstreamClosed;
                    }
                }
            }
        };
        if end == RelayEnd::DownstreamClosed {
            let _ = upstream_tx.send(WsMessage::Close(None)).await;
        }
        let _ = upstream_tx.close().await;
        tracing::debug!(path = %path, ?end, "resource stream relay ended");
        end
    }))
}
