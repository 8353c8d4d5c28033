//! Local WebSocket relay for integration tests.
//!
//! Every text frame a client sends is recorded and forwarded to every
//! other connected client. `drop_all` severs live connections without a
//! close handshake, simulating a network drop.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub struct Relay {
    pub port: u16,
    fanout: broadcast::Sender<(usize, String)>,
    kill: broadcast::Sender<()>,
    received: Arc<Mutex<Vec<String>>>,
    queries: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl Relay {
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Text frames received from clients, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Query strings of every accepted handshake.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Send a raw text frame to every connected client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.fanout.send((usize::MAX, text.into()));
    }

    /// Drop every live connection without a close frame.
    pub fn drop_all(&self) {
        let _ = self.kill.send(());
    }
}

/// Start a relay on a free port.
pub async fn start_relay() -> Relay {
    let port = free_port().await;
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();

    let (fanout, _) = broadcast::channel::<(usize, String)>(256);
    let (kill, _) = broadcast::channel::<()>(4);
    let relay = Relay {
        port,
        fanout: fanout.clone(),
        kill: kill.clone(),
        received: Arc::new(Mutex::new(Vec::new())),
        queries: Arc::new(Mutex::new(Vec::new())),
        accepted: Arc::new(AtomicUsize::new(0)),
        active: Arc::new(AtomicUsize::new(0)),
    };

    let received = relay.received.clone();
    let queries = relay.queries.clone();
    let accepted = relay.accepted.clone();
    let active = relay.active.clone();
    tokio::spawn(async move {
        let mut next_id = 0usize;
        while let Ok((stream, _addr)) = listener.accept().await {
            let id = next_id;
            next_id += 1;

            let queries = queries.clone();
            let capture = move |req: &Request, resp: Response| {
                queries
                    .lock()
                    .unwrap()
                    .push(req.uri().query().unwrap_or_default().to_string());
                Ok::<_, ErrorResponse>(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, capture).await else {
                continue;
            };
            let fanout = fanout.clone();
            let mut fan_rx = fanout.subscribe();
            let mut kill_rx = kill.subscribe();
            accepted.fetch_add(1, Ordering::SeqCst);
            active.fetch_add(1, Ordering::SeqCst);

            let received = received.clone();
            let active = active.clone();
            tokio::spawn(async move {
                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        frame = source.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let text = text.as_str().to_owned();
                                received.lock().unwrap().push(text.clone());
                                let _ = fanout.send((id, text));
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        out = fan_rx.recv() => match out {
                            Ok((from, text)) if from != id => {
                                if sink.send(Message::text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = kill_rx.recv() => break,
                    }
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    relay
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
