//! TCP server for the node.
//!
//! Accepts connections, runs one reader loop per connection, and tears
//! each connection down exactly once when its reader loop ends.

use crate::codec::{FrameReader, Message};
use crate::config::Config;
use crate::connection::{Connection, ConnectionOptions};
use crate::dispatcher::{Dispatcher, HandlerContext};
use crate::error::{NodeError, Result};
use crate::handlers::CONNECTION_CLOSED;
use crate::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            registry: Registry::new(),
            dispatcher,
            connection_limit,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let address = self.config.listen_address();
        let listener = match self.config.bind_addr().and_then(bind) {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %address, error = %e, "Failed to bind listener");
                return Err(e.into());
            }
        };
        info!(address = %address, "Server listening");
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            // Wait for a connection slot
            let permit = match Arc::clone(&self.connection_limit).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let session = Session {
                        registry: Arc::clone(&self.registry),
                        dispatcher: Arc::clone(&self.dispatcher),
                        options: self.config.connection_options(),
                        idle_timeout: self.config.idle_timeout,
                    };
                    tokio::spawn(async move {
                        session.handle_stream(stream, peer).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Create a non-blocking listener with SO_REUSEADDR set.
fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Everything a connection task needs from the server.
struct Session {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    options: ConnectionOptions,
    idle_timeout: Option<Duration>,
}

impl Session {
    async fn handle_stream(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let conn = Connection::new(peer, writer, &self.options);
        self.registry.add_connection(&conn);

        if let Err(e) = self.read_loop(&conn, FrameReader::new(reader)).await {
            match e {
                NodeError::ConnectionClosed => trace!(peer = %peer, "Connection closed by client"),
                e => debug!(peer = %peer, error = %e, "Connection error"),
            }
        }

        self.teardown(&conn).await;
    }

    /// Read and dispatch messages until the peer goes away, a read fails,
    /// or the writer reports the connection broken.
    async fn read_loop<R>(&self, conn: &Arc<Connection>, mut reader: FrameReader<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = tokio::select! {
                result = read_with_deadline(&mut reader, self.idle_timeout) => result?,
                _ = conn.broken() => return Err(NodeError::ConnectionClosed),
            };

            trace!(conn = %conn.id(), command = %message.command_str(), "Received message");
            let ctx = HandlerContext::new(Arc::clone(conn), Arc::clone(&self.registry));
            self.dispatcher.dispatch(ctx, message).await;
        }
    }

    /// Remove the connection, release its queue and stream, and tell
    /// everyone else it is gone.
    async fn teardown(&self, conn: &Arc<Connection>) {
        self.registry.remove_connection(conn);
        if !conn.close().await {
            return;
        }

        let cancelled = self.dispatcher.cancel_pending(conn.id());
        if cancelled > 0 {
            debug!(conn = %conn.id(), cancelled, "Cancelled pending requests");
        }

        let notice = Message::new(CONNECTION_CLOSED, conn.peer().to_string());
        let notified = self.registry.broadcast(&notice).await;
        debug!(peer = %conn.peer(), notified, "Connection closed");
    }
}

async fn read_with_deadline<R>(
    reader: &mut FrameReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(deadline) => tokio::time::timeout(deadline, reader.read_message())
            .await
            .map_err(|_| NodeError::Timeout)?,
        None => reader.read_message().await,
    }
}
