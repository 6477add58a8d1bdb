//! Push-channel connection to the backend status feed.
//!
//! A [`FeedConnection`] owns at most one live WebSocket, fans inbound frames
//! out to the handlers in its [`HandlerRegistry`], and reconnects on
//! unexpected closure with a fixed delay and a bounded number of attempts.
//! It knows nothing about what the messages mean.

use crate::registry::{dispatch, FeedHandler, HandlerRegistry};
use crate::timer::TimerSlot;
use futures_util::{SinkExt, StreamExt};
use jobdash_core::feed::{decode_frame, encode_frame, FrameError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: Url,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("feed connect failed: {0}")]
    Connect(String),
    #[error("feed connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("feed connection closed before it became ready")]
    Closed,
}

enum Outbound {
    Frame(String),
    Close,
}

struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct LinkState {
    active: Option<ActiveLink>,
    generation: u64,
    intentionally_closed: bool,
    /// Bumped by every `disconnect()`; an open that started under an older
    /// value gives up.
    disconnects: u64,
    reconnect_attempts: u32,
    reconnect_timer: TimerSlot,
}

struct Inner {
    config: FeedConfig,
    registry: Mutex<HandlerRegistry>,
    link: Mutex<LinkState>,
    connect_gate: tokio::sync::Mutex<()>,
}

/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct FeedConnection {
    inner: Arc<Inner>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FeedConnection {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HandlerRegistry::default()),
                link: Mutex::new(LinkState::default()),
                connect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    /// Explicit connect. Resolves immediately if already connected; otherwise
    /// starts a fresh reconnect budget and opens the channel.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let epoch = {
            let mut link = lock(&self.inner.link);
            if link.active.is_some() {
                return Ok(());
            }
            link.reconnect_attempts = 0;
            link.reconnect_timer.cancel();
            link.intentionally_closed = false;
            link.disconnects
        };
        self.open(epoch).await
    }

    async fn open(&self, epoch: u64) -> Result<(), ChannelError> {
        let _gate = self.inner.connect_gate.lock().await;
        {
            let link = lock(&self.inner.link);
            if link.disconnects != epoch {
                debug!(event = "feed_connect_cancelled");
                return Err(ChannelError::Closed);
            }
            if link.active.is_some() {
                return Ok(());
            }
        }

        let config = &self.inner.config;
        info!(event = "feed_connecting", url = %config.url);
        let attempt = tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await;
        let stream = match attempt {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => return Err(self.open_failed(ChannelError::Connect(err.to_string()))),
            Err(_) => return Err(self.open_failed(ChannelError::Timeout(config.connect_timeout))),
        };

        let opened = {
            let mut link = lock(&self.inner.link);
            if link.disconnects != epoch {
                None
            } else {
                link.generation += 1;
                link.reconnect_attempts = 0;
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                link.active = Some(ActiveLink {
                    generation: link.generation,
                    outbound,
                });
                Some((link.generation, outbound_rx))
            }
        };
        let Some((generation, outbound_rx)) = opened else {
            let mut stream = stream;
            let _ = stream.close(None).await;
            debug!(event = "feed_connect_superseded");
            return Err(ChannelError::Closed);
        };

        info!(event = "feed_connected", url = %config.url, generation);
        tokio::spawn(run_link(self.clone(), stream, outbound_rx, generation));
        Ok(())
    }

    /// A failed open counts as an unexpected closure, so it feeds the same
    /// reconnect path a dropped connection does.
    fn open_failed(&self, err: ChannelError) -> ChannelError {
        warn!(event = "feed_connect_error", error = %err);
        self.schedule_reconnect();
        err
    }

    pub fn disconnect(&self) {
        let mut link = lock(&self.inner.link);
        link.intentionally_closed = true;
        link.disconnects += 1;
        if link.reconnect_timer.cancel() {
            debug!(event = "feed_reconnect_cancelled");
        }
        if let Some(active) = link.active.take() {
            let _ = active.outbound.send(Outbound::Close);
        }
        info!(event = "feed_disconnected");
    }

    /// Serializes and queues `message` if connected. Returns whether it was queued.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        let link = lock(&self.inner.link);
        let Some(active) = link.active.as_ref() else {
            warn!(event = "feed_send_skipped", reason = "not connected");
            return false;
        };
        match encode_frame(message, self.inner.config.max_frame_bytes) {
            Ok(text) => active.outbound.send(Outbound::Frame(text)).is_ok(),
            Err(err) => {
                warn!(event = "feed_send_skipped", reason = %err);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).active.is_some()
    }

    pub fn on(&self, event_type: &str, handler: FeedHandler) {
        lock(&self.inner.registry).on(event_type, handler);
    }

    pub fn off(&self, event_type: &str, handler: &FeedHandler) -> bool {
        lock(&self.inner.registry).off(event_type, handler)
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        lock(&self.inner.registry).count(event_type)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.link).reconnect_attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.inner.link).reconnect_timer.is_pending()
    }

    /// Parses one inbound frame and runs its handlers. Bad frames are logged
    /// and dropped.
    pub(crate) fn dispatch_frame(&self, bytes: &[u8]) {
        let message = match decode_frame(bytes, self.inner.config.max_frame_bytes) {
            Ok(message) => message,
            Err(FrameError::MissingType) => {
                warn!(event = "feed_frame_dropped", reason = "missing type");
                return;
            }
            Err(err) => {
                warn!(event = "feed_frame_dropped", reason = %err);
                return;
            }
        };
        // Snapshot so handlers may call on/off without deadlocking.
        let handlers = lock(&self.inner.registry).handlers_for(&message.event_type);
        if handlers.is_empty() {
            debug!(event = "feed_frame_unhandled", event_type = %message.event_type);
            return;
        }
        dispatch(&handlers, &message);
    }

    fn link_closed(&self, generation: u64) {
        let intentional = {
            let mut link = lock(&self.inner.link);
            if link.generation != generation {
                return;
            }
            if link
                .active
                .as_ref()
                .map(|active| active.generation == generation)
                .unwrap_or(false)
            {
                link.active = None;
            }
            link.intentionally_closed
        };
        if intentional {
            debug!(event = "feed_closed", generation);
            return;
        }
        warn!(event = "feed_closed_unexpectedly", generation);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let mut link = lock(&self.inner.link);
        if link.intentionally_closed {
            return;
        }
        let max = self.inner.config.max_reconnect_attempts;
        if link.reconnect_attempts >= max {
            warn!(event = "feed_reconnect_exhausted", attempts = link.reconnect_attempts, max);
            return;
        }
        link.reconnect_timer.cancel();
        link.reconnect_attempts += 1;
        let attempt = link.reconnect_attempts;
        let delay = self.inner.config.reconnect_delay;
        info!(
            event = "feed_reconnect_scheduled",
            attempt,
            max,
            delay_ms = delay.as_millis() as u64
        );

        let connection = self.clone();
        link.reconnect_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let epoch = {
                let mut link = lock(&connection.inner.link);
                link.reconnect_timer.release();
                link.disconnects
            };
            // Failure already re-entered schedule_reconnect via open_failed.
            if let Err(err) = connection.open(epoch).await {
                debug!(event = "feed_reconnect_failed", attempt, error = %err);
            }
        }));
    }
}

async fn run_link(
    connection: FeedConnection,
    mut ws: FeedStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    generation: u64,
) {
    loop {
        tokio::select! {
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => connection.dispatch_frame(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => connection.dispatch_frame(&bytes),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "feed_close_frame", generation, reason = ?frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "feed_read_error", generation, error = %err);
                        break;
                    }
                    None => break,
                }
            }
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Frame(text)) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            warn!(event = "feed_write_error", generation, error = %err);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        }
    }
    connection.link_closed(generation);
}
