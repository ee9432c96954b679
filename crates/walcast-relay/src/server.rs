//! WebSocket front end.
//!
//! Accepts sockets up to a connection limit, reads the optional `?token=`
//! from the handshake, and pumps frames between each socket and its
//! registry queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::registry::{ClientRegistry, Outbound};
use crate::supervisor::shutdown_requested;

pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ClientRegistry,
    max_connections: usize,
}

impl WsServer {
    pub async fn bind(addr: &str, registry: ClientRegistry, max_connections: usize) -> RelayResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "WebSocket server bound");

        Ok(Self {
            listener,
            local_addr,
            registry,
            max_connections: max_connections.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop. It stops accepting once `shutdown` flips to
    /// `true`; open connections send a close frame and unregister.
    pub fn serve(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(accept_loop(
            self.listener,
            self.registry,
            Arc::new(Semaphore::new(self.max_connections)),
            shutdown,
        ))
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: ClientRegistry,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => {
                info!("WebSocket server shutting down");
                break;
            }

            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(peer = %peer, "Connection limit reached, rejecting");
                                continue;
                            }
                        };

                        let registry = registry.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, registry, shutdown).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept error");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: ClientRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut query_token = None;
    let callback = |request: &Request, response: Response| {
        query_token = token_from_uri(request.uri());
        Ok::<_, ErrorResponse>(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (id, mut outbound) = registry.register(query_token.as_deref()).await;
    debug!(connection = %id, peer = %peer, "Client connected");

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                break;
            }

            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        debug!(connection = %id, error = %e, "Send failed");
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },

            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !registry.handle_message(id, text.as_str()).await {
                        close_rejected(&mut write, &mut outbound).await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data);
                    if !registry.handle_message(id, &text).await {
                        close_rejected(&mut write, &mut outbound).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }

    registry.unregister(id).await;
    debug!(connection = %id, "Client disconnected");
}

/// Flush the replies already queued for a rejected client, then close.
///
/// The close is sent here even when the queue had no room for it.
async fn close_rejected<W>(write: &mut W, outbound: &mut mpsc::Receiver<Outbound>)
where
    W: Sink<Message> + Unpin,
{
    while let Ok(Outbound::Text(text)) = outbound.try_recv() {
        if write.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = write.send(Message::Close(None)).await;
}

/// The `token` query parameter of a handshake URI.
fn token_from_uri(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

/// Wait until every client has unregistered or `grace` runs out.
pub async fn drain(registry: &ClientRegistry, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        let remaining = registry.len().await;
        if remaining == 0 {
            debug!("All clients disconnected");
            return;
        }
        if Instant::now() >= deadline {
            warn!(clients = remaining, "Shutdown grace period elapsed with clients still connected");
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
}
