//! Websocket change-stream client.
//!
//! One task per subscription: it connects, decodes row-change frames and
//! forwards them into the channel handed to the realtime manager. The task
//! ends when the transport errors, the server closes, or the subscriber is
//! dropped; reconnection policy lives with the realtime manager, not here.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tidemark_core::remote::ports::ChannelSubscription;
use tidemark_core::{RemoteError, RemoteResult};
use tidemark_domain::{ChangeEvent, ChangeEventType, ChannelMessage, Entity};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use super::client::EgressCounter;

const CHANNEL_CAPACITY: usize = 256;

/// Wire form of one change frame.
#[derive(Debug, Deserialize)]
struct ChangeFrame {
    table: String,
    event_type: String,
    new: Option<Entity>,
    old: Option<Entity>,
}

/// Connect and spawn the forwarding task for one subscription.
pub(crate) async fn spawn_channel_task(
    url: String,
    egress: Arc<EgressCounter>,
) -> RemoteResult<ChannelSubscription> {
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| RemoteError::Network(format!("websocket connect failed: {e}")))?;

    debug!(url = %url, "change stream connected");

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_channel(stream, tx, egress));

    Ok(ChannelSubscription::new(rx))
}

async fn run_channel<S>(
    mut stream: tokio_tungstenite::WebSocketStream<S>,
    tx: mpsc::Sender<ChannelMessage>,
    egress: Arc<EgressCounter>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            // Subscriber dropped; tear the transport down.
            () = tx.closed() => {
                let _ = stream.close(None).await;
                debug!("change stream closed by subscriber");
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(raw))) => {
                    egress.add(raw.len() as u64);
                    match decode_frame(raw.as_str()) {
                        Ok(event) => {
                            if tx.send(ChannelMessage::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(reason) => {
                            warn!(reason = %reason, "dropping undecodable change frame");
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    if stream.send(WsMessage::Pong(payload)).await.is_err() {
                        let _ = tx.send(ChannelMessage::Error("pong failed".to_string())).await;
                        return;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    let _ = tx.send(ChannelMessage::Closed).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = tx.send(ChannelMessage::Error(e.to_string())).await;
                    return;
                }
            }
        }
    }
}

fn decode_frame(raw: &str) -> Result<ChangeEvent, String> {
    let frame: ChangeFrame =
        serde_json::from_str(raw).map_err(|e| format!("frame parse failed: {e}"))?;

    let event_type = match frame.event_type.as_str() {
        "INSERT" => ChangeEventType::Insert,
        "UPDATE" => ChangeEventType::Update,
        "DELETE" => ChangeEventType::Delete,
        other => return Err(format!("unknown event type: {other}")),
    };

    Ok(ChangeEvent { table: frame.table, event_type, new: frame.new, old: frame.old })
}
