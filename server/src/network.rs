//! WebSocket transport: accept loop, per-connection tasks, tick scheduling

use crate::config::ServerConfig;
use crate::connection_manager::{encode, ConnectionId, ConnectionManager, MessageOutcome};
use crate::error::SessionError;
use crate::store::PlayerStore;
use crate::sync::SyncEngine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ProtocolError, ServerMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Handshake callback accepting every origin.
///
/// Browsers may connect from anywhere; identity is never taken from the
/// request, so the origin is only logged.
fn allow_any_origin(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    if let Some(origin) = request.headers().get(ORIGIN) {
        debug!("WebSocket handshake from origin {:?}", origin);
    }
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(response)
}

fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.to_string().into(),
    }
}

/// How long shutdown waits for connection tasks to send their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Settings each connection task needs.
#[derive(Debug, Clone)]
struct ConnectionSettings {
    idle_timeout: Option<Duration>,
    outbound_queue: usize,
    /// Flips to `true` once the server starts shutting down.
    shutdown: watch::Receiver<bool>,
}

/// Main server coordinating the listener, connection tasks and the tick
pub struct Server {
    listener: TcpListener,
    connections: Arc<ConnectionManager>,
    config: ServerConfig,
}

impl Server {
    /// Binds the listener and creates an empty session.
    ///
    /// An `outbound_queue` of zero is raised to one.
    pub async fn new(mut config: ServerConfig) -> Result<Self, SessionError> {
        config.outbound_queue = config.outbound_queue.max(1);
        let listener = TcpListener::bind(&config.bind_address).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let store = Arc::new(PlayerStore::new());
        let connections = Arc::new(ConnectionManager::new(store, &config));

        Ok(Server {
            listener,
            connections,
            config,
        })
    }

    /// Address the listener is bound to, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the connection registry and its store.
    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connections)
    }

    /// Serves until the process is stopped.
    pub async fn run(self) -> Result<(), SessionError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serves until `shutdown` resolves.
    ///
    /// On shutdown the tick stops, every live connection receives a close
    /// frame with code 1001 and its player is removed from the store.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let sync = SyncEngine::new(Arc::clone(&self.connections), &self.config);
        let sync_handle = tokio::spawn(sync.run());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = ConnectionSettings {
            idle_timeout: self.config.idle_timeout,
            outbound_queue: self.config.outbound_queue,
            shutdown: shutdown_rx,
        };
        let mut tasks = JoinSet::new();

        info!(
            "Server started successfully ({:?} sync, tick every {:?})",
            self.config.sync_mode, self.config.tick_duration
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }

                    let connections = Arc::clone(&self.connections);
                    let settings = settings.clone();
                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, connections, settings).await {
                            warn!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        sync_handle.abort();

        let _ = shutdown_tx.send(true);
        let live = tasks.len();
        if live > 0 {
            info!("Closing {} live connections", live);
        }
        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                tasks.len(),
                SHUTDOWN_GRACE
            );
            tasks.shutdown().await;
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connections: Arc<ConnectionManager>,
    settings: ConnectionSettings,
) -> Result<(), SessionError> {
    let ws_stream = accept_hdr_async(stream, allow_any_origin).await?;
    let (mut sink, mut source) = ws_stream.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue);
    let connection_id = match connections.on_connect(addr, outbound_tx).await {
        Ok((connection_id, _)) => connection_id,
        Err(e @ SessionError::ServerFull(_)) => {
            warn!("Rejecting {}: {}", addr, e);
            let rejection = ServerMessage::Disconnected {
                reason: "Server full".to_string(),
            };
            if let Some(message) = encode(&rejection) {
                let _ = sink.send(message).await;
            }
            let _ = sink
                .send(Message::Close(Some(close_frame(CloseCode::Again, "server full"))))
                .await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let mut shutdown = settings.shutdown;

    let (close_tx, close_rx) = oneshot::channel();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, close_rx));

    let result = read_loop(
        connection_id,
        &mut source,
        &connections,
        settings.idle_timeout,
        &mut shutdown,
    )
    .await;

    // Signal the writer before teardown drops the outbound sender, so the
    // close frame wins over a plain end of queue.
    let frame = match &result {
        Ok(frame) => frame.clone(),
        Err(_) => None,
    };
    let _ = close_tx.send(frame);
    connections.on_disconnect(connection_id).await;
    if let Err(e) = writer.await {
        debug!("Writer task for connection {} failed: {}", connection_id, e);
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_droppable() => {
            debug!("Connection {} dropped: {}", connection_id, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Drains the outbound queue into the socket.
///
/// When the close signal arrives, anything still queued is discarded and the
/// close frame goes out instead.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Message>,
    mut close: oneshot::Receiver<Option<CloseFrame>>,
) {
    loop {
        tokio::select! {
            biased;
            frame = &mut close => {
                let _ = sink.send(Message::Close(frame.unwrap_or(None))).await;
                break;
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        debug!("Send failed, stopping writer: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Feeds inbound frames to the connection manager until the connection ends.
///
/// Returns the close frame to send back, if the server is the side closing.
async fn read_loop(
    connection_id: ConnectionId,
    source: &mut WsSource,
    connections: &ConnectionManager,
    idle_timeout: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<CloseFrame>, SessionError> {
    loop {
        if *shutdown.borrow() {
            return Ok(Some(close_frame(CloseCode::Away, "server shutting down")));
        }

        let idle = async {
            match idle_timeout {
                Some(limit) => sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let next = tokio::select! {
            _ = shutdown.changed() => {
                debug!("Closing connection {} for shutdown", connection_id);
                return Ok(Some(close_frame(CloseCode::Away, "server shutting down")));
            }
            _ = idle => {
                info!(
                    "Connection {} idle for {:?}, closing",
                    connection_id,
                    idle_timeout.unwrap_or_default()
                );
                return Ok(Some(close_frame(CloseCode::Away, "idle timeout")));
            }
            next = source.next() => next,
        };

        let outcome = match next {
            Some(Ok(Message::Text(text))) => connections.on_message(connection_id, text.as_str()).await,
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => connections.on_message(connection_id, text).await,
                Err(_) => {
                    connections
                        .on_malformed(connection_id, ProtocolError::NotUtf8.into())
                        .await
                }
            },
            Some(Ok(Message::Close(frame))) => {
                debug!("Connection {} requested close: {:?}", connection_id, frame);
                return Ok(None);
            }
            // Pings are answered by the protocol layer.
            Some(Ok(_)) => MessageOutcome::Continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        };

        if outcome == MessageOutcome::Disconnect {
            return Ok(Some(close_frame(CloseCode::Policy, "protocol violation")));
        }
    }
}
