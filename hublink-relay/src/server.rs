//! WebSocket transport for the relay.
//!
//! ```text
//! Client A ──┐                         ┌─► outbox A ─► socket A
//!            ├── ?instanceId=R ── Relay ┼─► outbox B ─► socket B
//! Client B ──┘        │                └─► outbox C ─► socket C
//!                     ▼
//!                DeviceStore
//! ```
//!
//! One task per connection. Each task multiplexes three sources with
//! `tokio::select!`: inbound frames (processed one at a time, in order),
//! its outbound queue, and the keepalive ticker. Every socket write is
//! bounded by the send timeout, so a peer that stops reading is dropped
//! instead of stalling its task while its queue keeps growing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::config::ServerConfig;
use crate::protocol::room_id_from_query;
use crate::relay::Relay;

/// Close reason sent when the query carries no room id.
pub const MISSING_ID_REASON: &str = "Instance ID required";

/// How long to wait for the client's half of a policy close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Transport errors. None of them outlive the connection they occur on.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error("socket write blocked for more than {0:?}")]
    SendTimeout(Duration),
}

/// The relay's WebSocket server.
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.ws_bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.ws_bind_addr).await?;
        log::info!("WebSocket relay listening on {}", self.config.ws_bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let heartbeat = self.config.heartbeat_interval();
        let send_timeout = self.config.send_timeout();
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, relay, heartbeat, send_timeout).await
                {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Drive one connection from handshake to cleanup.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay>,
    heartbeat: Option<Duration>,
    send_timeout: Duration,
) -> Result<(), RelayError> {
    let mut query: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let Some(device_id) = room_id_from_query(query.as_deref()) else {
        log::warn!("Rejecting connection from {addr}: no instance id");
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: MISSING_ID_REASON.into(),
        }));
        send_bounded(&mut ws_sender, close, CLOSE_GRACE).await?;
        // Let the client finish the closing handshake.
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(_)) = ws_receiver.next().await {}
        })
        .await;
        return Ok(());
    };

    let (session, mut outgoing) = relay.join(&device_id).await;
    log::debug!("{addr} joined {device_id} as {}", session.conn_id());

    let mut ticker = heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut awaiting_pong = false;

    let result: Result<(), RelayError> = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        relay.handle_text(&session, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        relay.handle_binary(&session, &data).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let pong = Message::Pong(data);
                        if let Err(e) = send_bounded(&mut ws_sender, pong, send_timeout).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        break Err(e.into());
                    }
                }
            }

            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        let msg = Message::text(frame.to_string());
                        if let Err(e) = send_bounded(&mut ws_sender, msg, send_timeout).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                }
            }

            _ = tick(&mut ticker) => {
                if awaiting_pong {
                    log::warn!("No pong from {addr} ({device_id}), terminating");
                    break Ok(());
                }
                awaiting_pong = true;
                let ping = Message::Ping(Default::default());
                if let Err(e) = send_bounded(&mut ws_sender, ping, send_timeout).await {
                    break Err(e);
                }
            }
        }
    };

    // Graceful close and transport failure take the same cleanup path.
    relay.leave(session).await;
    result
}

/// Write one message, giving up after `limit`.
async fn send_bounded<S>(sink: &mut S, msg: Message, limit: Duration) -> Result<(), RelayError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => Err(RelayError::SendTimeout(limit)),
    }
}

/// Wait for the next keepalive tick, or forever when keepalive is off.
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
