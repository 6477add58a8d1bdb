use crate::channel::FeedConfig;
use futures_util::{SinkExt, StreamExt};
use jobdash_core::feed::DEFAULT_MAX_FRAME_BYTES;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub type ServerSide = WebSocketStream<TcpStream>;

/// In-process feed server. While `accepting` is false every TCP connection is
/// dropped before the WebSocket handshake, which the client sees as a
/// failed connect.
pub struct TestFeedServer {
    addr: SocketAddr,
    pub accepting: Arc<AtomicBool>,
    handshakes: Arc<AtomicUsize>,
    clients: mpsc::UnboundedReceiver<ServerSide>,
}

impl TestFeedServer {
    pub async fn launch() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind feed server");
        let addr = listener.local_addr().expect("feed server addr");
        let accepting = Arc::new(AtomicBool::new(true));
        let handshakes = Arc::new(AtomicUsize::new(0));
        let (tx, clients) = mpsc::unbounded_channel();

        let accept_flag = accepting.clone();
        let attempt_count = handshakes.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                if !accept_flag.load(Ordering::SeqCst) {
                    drop(tcp);
                    continue;
                }
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            accepting,
            handshakes,
            clients,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/ws", self.addr)).expect("feed url")
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub async fn next_client(&mut self) -> ServerSide {
        tokio::time::timeout(WAIT_LIMIT, self.clients.recv())
            .await
            .expect("client within time limit")
            .expect("server accept loop alive")
    }

    pub async fn push(client: &mut ServerSide, value: &Value) {
        Self::push_raw(client, &value.to_string()).await;
    }

    pub async fn push_raw(client: &mut ServerSide, text: &str) {
        client
            .send(Message::Text(text.to_string()))
            .await
            .expect("push frame");
    }

    pub async fn receive(client: &mut ServerSide) -> Value {
        loop {
            let next = tokio::time::timeout(WAIT_LIMIT, client.next())
                .await
                .expect("frame within time limit")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = next {
                return serde_json::from_str(&text).expect("json frame");
            }
        }
    }

    /// True once the client has sent a close frame or dropped the socket.
    pub async fn closed(client: &mut ServerSide) -> bool {
        loop {
            match tokio::time::timeout(WAIT_LIMIT, client.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

pub fn feed_config(url: &Url, reconnect_delay_ms: u64, max_reconnect_attempts: u32) -> FeedConfig {
    FeedConfig {
        url: url.clone(),
        reconnect_delay: Duration::from_millis(reconnect_delay_ms),
        max_reconnect_attempts,
        connect_timeout: Duration::from_secs(2),
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
    }
}

pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
