//! Websocket gateway connection.
//!
//! Handles the minimum needed to keep a session alive: identify after
//! `HELLO`, heartbeat on the advertised interval, answer heartbeat requests.
//! Every text or binary message is forwarded as a raw frame. Resuming and
//! reconnecting are left to the caller (reopen the session).

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use chatwire_core::{
    Gateway, GatewayError, Identifier, Intents,
    event::HelloEvent,
    op::{self, OpCode},
};
use futures::{SinkExt, StreamExt, stream::BoxStream};
use serde::Deserialize;
use serde_json::{json, value::RawValue};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// Frames buffered between the socket and the consumer.
const FRAME_BACKLOG: usize = 64;

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Gateway transport over a websocket.
pub struct WsGateway {
    url: String,
    identifier: Mutex<Identifier>,
    last_error: Arc<Mutex<Option<GatewayError>>>,
}

impl WsGateway {
    /// Create an unopened gateway for the full websocket URL.
    #[must_use]
    pub fn new(url: impl Into<String>, identifier: Identifier) -> Self {
        Self {
            url: url.into(),
            identifier: Mutex::new(identifier),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Gateway for WsGateway {
    fn connect(&self, cancel: CancellationToken) -> BoxStream<'static, Bytes> {
        let (tx, rx) = mpsc::channel(FRAME_BACKLOG);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let conn = Connection {
            url: self.url.clone(),
            identifier: self.identifier(),
            tx,
        };
        let last_error = Arc::clone(&self.last_error);

        tokio::spawn(async move {
            // Record the failure before `conn` (and with it the frame sender)
            // is dropped, so consumers that see the stream end can read it.
            if let Err(e) = conn.run(cancel).await {
                tracing::error!(url = %conn.url, "Gateway connection failed: {e}");
                *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            }
            drop(conn);
        });

        ReceiverStream::new(rx).boxed()
    }

    fn add_intents(&self, intents: Intents) {
        self.identifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_intents(intents);
    }

    fn last_error(&self) -> Option<GatewayError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn identifier(&self) -> Identifier {
        self.identifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Deserialize)]
struct Peek<'a> {
    op: OpCode,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default, borrow)]
    d: Option<&'a RawValue>,
}

/// One live websocket connection.
struct Connection {
    url: String,
    identifier: Identifier,
    tx: mpsc::Sender<Bytes>,
}

impl Connection {
    async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let ws = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            res = connect_async(self.url.as_str()) => {
                res.map_err(|e| GatewayError::Connect(e.to_string()))?.0
            }
        };
        tracing::debug!(url = %self.url, "Gateway connected");

        let (mut sink, mut stream) = ws.split();
        let mut heartbeat: Option<Interval> = None;
        let mut sequence: Option<u64> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!("Failed to send close frame: {e}");
                    }
                    return Ok(());
                }
                () = tick(&mut heartbeat) => {
                    send_heartbeat(&mut sink, sequence).await?;
                }
                msg = stream.next() => {
                    let frame = match msg {
                        None => {
                            return Err(GatewayError::Transport(
                                "connection ended without a close frame".to_string(),
                            ));
                        }
                        Some(Err(e)) => return Err(GatewayError::Transport(e.to_string())),
                        Some(Ok(Message::Text(text))) => Bytes::from(text),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame.map_or((1005, String::new()), |f| {
                                (u16::from(f.code), f.reason.as_str().to_owned())
                            });
                            return Err(GatewayError::Closed { code, reason });
                        }
                        Some(Ok(_)) => continue,
                    };

                    let action = self.inspect(&frame, &mut heartbeat, &mut sequence);

                    if self.tx.send(frame).await.is_err() {
                        // Consumer went away.
                        return Ok(());
                    }

                    match action {
                        Action::None => {}
                        Action::Identify => self.identify(&mut sink).await?,
                        Action::Heartbeat => send_heartbeat(&mut sink, sequence).await?,
                        Action::Fail(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Look at a frame's opcode to keep the connection's own state.
    fn inspect(
        &self,
        frame: &[u8],
        heartbeat: &mut Option<Interval>,
        sequence: &mut Option<u64>,
    ) -> Action {
        let Ok(peek) = serde_json::from_slice::<Peek<'_>>(frame) else {
            // Undecodable frames are still forwarded; the codec reports them.
            return Action::None;
        };

        if peek.s.is_some() {
            *sequence = peek.s;
        }

        match peek.op {
            op::HELLO => {
                let hello = peek
                    .d
                    .and_then(|d| serde_json::from_str::<HelloEvent>(d.get()).ok());
                let Some(hello) = hello else {
                    return Action::Fail(GatewayError::Protocol("malformed hello".to_string()));
                };
                let period = Duration::from_millis(hello.heartbeat_interval.max(1));
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *heartbeat = Some(interval);
                tracing::debug!(interval_ms = hello.heartbeat_interval, url = %self.url, "Gateway hello");
                Action::Identify
            }
            op::HEARTBEAT => Action::Heartbeat,
            op::RECONNECT => Action::Fail(GatewayError::Protocol(
                "server requested reconnect".to_string(),
            )),
            op::INVALID_SESSION => {
                Action::Fail(GatewayError::Protocol("session invalidated".to_string()))
            }
            _ => Action::None,
        }
    }

    async fn identify(&self, sink: &mut WsSink) -> Result<(), GatewayError> {
        let payload = json!({ "op": op::IDENTIFY, "d": &self.identifier });
        sink.send(Message::text(payload.to_string()))
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }
}

enum Action {
    None,
    Identify,
    Heartbeat,
    Fail(GatewayError),
}

async fn send_heartbeat(sink: &mut WsSink, sequence: Option<u64>) -> Result<(), GatewayError> {
    let payload = json!({ "op": op::HEARTBEAT, "d": sequence });
    sink.send(Message::text(payload.to_string()))
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
