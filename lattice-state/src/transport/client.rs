//! WebSocket client for the remote side.
//!
//! A [`SyncClient`] owns the channels for every key the process mirrors.
//! [`SyncClient::run`] keeps a connection open: after every (re)connect each
//! channel resubscribes and receives a full value, and queued writes are
//! replayed from there. Lost connections are retried with exponential
//! backoff until [`SyncClient::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::{ProtocolError, TransportError};
use crate::reactive::Runtime;
use crate::sync::{StateChannel, SyncEvent};

use super::protocol::{decode, encode, Envelope};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ClientInner {
    rt: Runtime,
    config: ClientConfig,
    channels: DashMap<String, StateChannel>,
    events: broadcast::Sender<SyncEvent>,
    link: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    shutdown: watch::Sender<bool>,
}

/// Connection to an authoritative server, shared by all local channels.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    pub fn new(rt: &Runtime, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                rt: rt.clone(),
                config,
                channels: DashMap::new(),
                events,
                link: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The channel for `key`, created on first use.
    ///
    /// `initial` is only used when the channel is created and is shown
    /// until the server's value arrives.
    pub fn channel(&self, key: &str, initial: Value) -> StateChannel {
        if let Some(existing) = self.inner.channels.get(key) {
            return existing.value().clone();
        }

        let channel = self
            .inner
            .channels
            .entry(key.to_string())
            .or_insert_with(|| {
                StateChannel::with_events(
                    &self.inner.rt,
                    key,
                    initial,
                    self.inner.config.offline_queue_capacity,
                    self.inner.events.clone(),
                )
            })
            .value()
            .clone();

        let link = self.inner.link.lock().clone();
        if let Some(link) = link {
            channel.attach(link);
        }
        channel
    }

    /// Sync events from every channel of this client.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Stop [`SyncClient::run`] and close the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Connect and keep reconnecting until shut down.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let initial_delay = self.inner.config.reconnect_initial_delay();
        let max_delay = self.inner.config.reconnect_max_delay();
        let mut delay = initial_delay;

        while !*shutdown.borrow() {
            match connect_async(self.inner.config.url.as_str()).await {
                Ok((socket, _)) => {
                    delay = initial_delay;
                    tracing::info!(url = %self.inner.config.url, "connected");
                    match self.session(socket, &mut shutdown).await {
                        Ok(()) => tracing::info!("connection closed"),
                        Err(err) => tracing::warn!(error = %err, "connection lost"),
                    }
                }
                Err(err) => {
                    tracing::warn!(url = %self.inner.config.url, error = %err, ?delay, "connect failed");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
            delay = next_delay(delay, max_delay);
        }

        tracing::debug!("sync client stopped");
        Ok(())
    }

    /// Drive one connection. Channels are attached for its lifetime and
    /// detached again however it ends.
    async fn session(&self, socket: Socket, shutdown: &mut watch::Receiver<bool>) -> Result<(), TransportError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.inner.link.lock() = Some(tx.clone());

        let channels: Vec<StateChannel> = self.inner.channels.iter().map(|c| c.value().clone()).collect();
        for channel in &channels {
            channel.attach(tx.clone());
        }
        drop(tx);

        let (mut ws_tx, mut ws_rx) = socket.split();
        let result: Result<(), TransportError> = async {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = ws_tx.close().await;
                        return Ok(());
                    }
                    Some(envelope) = rx.recv() => {
                        ws_tx.send(Message::Text(encode(&envelope)?.into())).await?;
                    }
                    inbound = ws_rx.next() => match inbound {
                        Some(Ok(Message::Text(text))) => self.route(decode(&text)?)?,
                        Some(Ok(Message::Binary(_))) => return Err(ProtocolError::BinaryFrame.into()),
                        Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    },
                }
            }
        }
        .await;

        *self.inner.link.lock() = None;
        for channel in self.inner.channels.iter() {
            channel.value().detach();
        }
        result
    }

    fn route(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let Some(key) = envelope.key() else {
            if let Envelope::Error { message } = &envelope {
                tracing::warn!(%message, "server reported an error");
            }
            return Ok(());
        };

        let channel = self.inner.channels.get(key).map(|c| c.value().clone());
        match channel {
            Some(channel) => channel.handle(envelope),
            None => {
                tracing::debug!(key, kind = envelope.kind(), "envelope for unknown channel ignored");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("url", &self.inner.config.url)
            .field("channels", &self.inner.channels.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_up_to_max() {
        let max = Duration::from_millis(500);
        let mut delay = Duration::from_millis(100);
        let mut seen = Vec::new();
        for _ in 0..5 {
            delay = next_delay(delay, max);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![200, 400, 500, 500, 500]);
    }

    #[test]
    fn channel_is_created_once() {
        let rt = Runtime::new();
        let client = SyncClient::new(&rt, ClientConfig::default());

        let a = client.channel("counter", json!(1));
        let b = client.channel("counter", json!(2));
        a.set(json!(5)).unwrap();

        assert_eq!(b.get_untracked(), json!(5));
        assert!(!client.is_connected());
    }

    #[test]
    fn routes_by_key() {
        let rt = Runtime::new();
        let client = SyncClient::new(&rt, ClientConfig::default());
        let channel = client.channel("counter", json!(0));
        let (tx, _rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        client
            .route(Envelope::Update {
                key: "counter".into(),
                value: json!(4),
                version: 4,
            })
            .unwrap();
        client
            .route(Envelope::Update {
                key: "elsewhere".into(),
                value: json!(1),
                version: 1,
            })
            .unwrap();

        assert_eq!(channel.get_untracked(), json!(4));
    }

    #[tokio::test]
    async fn shutdown_stops_reconnect_loop() {
        let rt = Runtime::new();
        let client = SyncClient::new(
            &rt,
            ClientConfig {
                url: "ws://127.0.0.1:1".into(),
                reconnect_initial_delay_ms: 10,
                reconnect_max_delay_ms: 20,
                ..ClientConfig::default()
            },
        );

        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), runner).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
