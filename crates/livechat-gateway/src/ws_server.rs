// WebSocket listener: accepts audience and admin clients, forwards their
// frames to the gateway loop and drains each connection's outbound queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use livechat_core::identity;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Outbound};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Events emitted by the WebSocket server to the gateway loop.
#[derive(Debug)]
pub enum WsEvent {
    /// Handshake completed. `outbound` feeds the connection's writer task.
    Connected {
        conn_id: ConnId,
        identity: Option<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    /// A text frame was received (raw JSON string).
    Message { conn_id: ConnId, text: String },
    Disconnected { conn_id: ConnId },
}

pub struct WsListener {
    listener: TcpListener,
    trust_forwarded_for: bool,
}

impl WsListener {
    pub async fn bind(addr: &str, trust_forwarded_for: bool) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            trust_forwarded_for,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Accept connections forever, spawning one task per client.
pub async fn run(listener: WsListener, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
    info!("WebSocket server listening on {}", listener.local_addr()?);
    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        let (stream, addr) = listener.listener.accept().await?;
        if tx.is_closed() {
            break;
        }
        let conn_id = next_id.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id, %addr, "accepted TCP connection");
        tokio::spawn(handle_connection(
            stream,
            addr,
            conn_id,
            listener.trust_forwarded_for,
            tx.clone(),
        ));
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: ConnId,
    trust_forwarded_for: bool,
    tx: mpsc::Sender<WsEvent>,
) {
    let mut forwarded_for: Option<String> = None;
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        forwarded_for = req
            .headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(conn_id, %addr, "WebSocket handshake failed: {e}");
            return;
        }
    };

    let identity = identity::resolve(Some(addr.ip()), forwarded_for.as_deref(), trust_forwarded_for);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connected = WsEvent::Connected {
        conn_id,
        identity,
        outbound: out_tx,
    };
    if tx.send(connected).await.is_err() {
        return;
    }

    let (write, read) = ws_stream.split();
    let (closed_tx, closed_rx) = oneshot::channel();
    let writer = tokio::spawn(async move {
        let mut write = write;
        write_outbound(&mut write, out_rx, closed_tx).await;
    });

    let _ = process_message_stream(read, conn_id, &tx, closed_rx).await;
    let _ = tx.send(WsEvent::Disconnected { conn_id }).await;
    writer.abort();
    debug!(conn_id, "connection task finished");
}

/// Forward text frames from `stream` to the gateway until the peer closes,
/// the stream errors, or `stop` resolves. Returns `Err(())` if the gateway
/// channel is closed.
pub async fn process_message_stream<St, F>(
    mut stream: St,
    conn_id: ConnId,
    tx: &mpsc::Sender<WsEvent>,
    stop: F,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    F: std::future::Future,
{
    tokio::pin!(stop);
    loop {
        let msg_result = tokio::select! {
            next = stream.next() => match next {
                Some(r) => r,
                None => break,
            },
            _ = &mut stop => {
                debug!(conn_id, "server closed connection");
                break;
            }
        };
        match msg_result {
            Ok(Message::Text(text)) => {
                let event = WsEvent::Message {
                    conn_id,
                    text: text.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id, "client sent close frame");
                break;
            }
            Err(e) => {
                warn!(conn_id, "WebSocket error: {e}");
                break;
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry no chat traffic.
            }
        }
    }
    Ok(())
}

/// Drain a connection's outbound queue into `sink`. A [`Outbound::Close`]
/// sends a policy close frame, fires `closed` and ends the task.
pub async fn write_outbound<Si>(
    sink: &mut Si,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closed: oneshot::Sender<()>,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(json) => {
                if let Err(e) = sink.send(Message::text(json.to_string())).await {
                    warn!("failed to write frame: {e}");
                    break;
                }
            }
            Outbound::Close { reason } => {
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("failed to write close frame: {e}");
                }
                break;
            }
        }
    }
    let _ = closed.send(());
}
