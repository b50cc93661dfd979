//! NIP-01 relay client over WebSocket

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nostr::{ClientMessage, Event, Filter, JsonUtil, RelayMessage, SubscriptionId};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{RelayClient, RelayNotification};
use crate::error::{Error, Result};

pub struct WebSocketRelayClient {
    publish_timeout: Duration,
}

impl WebSocketRelayClient {
    pub fn new(publish_timeout: Duration) -> Self {
        Self { publish_timeout }
    }
}

impl Default for WebSocketRelayClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn relay_error(relay: &str, e: impl std::fmt::Display) -> Error {
    Error::Relay(format!("{}: {}", relay, e))
}

#[async_trait]
impl RelayClient for WebSocketRelayClient {
    async fn publish(&self, relay: &str, event: &Event) -> Result<()> {
        let attempt = async {
            let (ws_stream, _) = connect_async(relay)
                .await
                .map_err(|e| relay_error(relay, e))?;
            let (mut write, mut read) = ws_stream.split();

            let msg = ClientMessage::event(event.clone());
            write
                .send(Message::Text(msg.as_json().into()))
                .await
                .map_err(|e| relay_error(relay, e))?;

            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(RelayMessage::Ok {
                            event_id,
                            status,
                            message,
                        }) = RelayMessage::from_json(&text)
                        {
                            if event_id != event.id {
                                continue;
                            }
                            let _ = write.close().await;
                            return if status {
                                Ok(())
                            } else {
                                Err(relay_error(relay, format!("rejected: {}", message)))
                            };
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(relay_error(relay, e)),
                }
            }

            Err(relay_error(relay, "closed before acknowledging"))
        };

        tokio::time::timeout(self.publish_timeout, attempt)
            .await
            .map_err(|_| relay_error(relay, "timed out waiting for OK"))?
    }

    async fn subscribe(
        &self,
        relay: &str,
        filter: Filter,
        notifications: mpsc::Sender<RelayNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Connecting to relay: {}", relay);

        let (ws_stream, _) = connect_async(relay)
            .await
            .map_err(|e| relay_error(relay, e))?;
        let (mut write, mut read) = ws_stream.split();

        let sub_id = SubscriptionId::generate();
        let req = ClientMessage::req(sub_id.clone(), vec![filter]);
        write
            .send(Message::Text(req.as_json().into()))
            .await
            .map_err(|e| relay_error(relay, e))?;

        info!("Subscribed to {} for call signals", relay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let close = ClientMessage::close(sub_id.clone());
                        let _ = write.send(Message::Text(close.as_json().into())).await;
                        let _ = write.close().await;
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let notification = match RelayMessage::from_json(&text) {
                                Ok(RelayMessage::Event { event, .. }) => RelayNotification::Event {
                                    relay: relay.to_string(),
                                    event,
                                },
                                Ok(RelayMessage::EndOfStoredEvents(_)) => RelayNotification::Eose {
                                    relay: relay.to_string(),
                                },
                                Ok(_) => continue,
                                Err(e) => {
                                    debug!("Unparseable message from {}: {}", relay, e);
                                    continue;
                                }
                            };
                            if notifications.send(notification).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("WebSocket closed: {}", relay);
                            break;
                        }
                        Some(Err(e)) => return Err(relay_error(relay, e)),
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }
}
