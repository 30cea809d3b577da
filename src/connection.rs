//! Per-socket connection state and the outbound write path.
//!
//! Reads and writes are decoupled: the reader loop owns the read half,
//! while outbound messages go through a bounded queue drained by a single
//! writer task. The writer is started lazily by the first `enqueue`.
//!
//! State machine:
//!
//! ```text
//! Open --(close / writer failure)--> Closing --(close + writer gone)--> Closed
//! ```
//!
//! `enqueue` only accepts messages while the connection is `Open`. After
//! `close`, a running writer gets `close_linger` to flush what is already
//! queued; then it is cut off and the write half is dropped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, trace, warn};

use crate::codec::{FrameWriter, Message};
use crate::error::{NodeError, Result};

/// Default outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default time a closed connection's writer may keep flushing.
pub const DEFAULT_CLOSE_LINGER: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepting outbound messages.
    Open,
    /// Teardown started or the writer failed; outbound messages are refused.
    Closing,
    /// Closed, and the write half has been released.
    Closed,
}

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tunables for the outbound path.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bounded outbound queue size.
    pub outbound_capacity: usize,
    /// Deadline for a single frame write (None = wait forever).
    pub write_timeout: Option<Duration>,
    /// How long the writer may keep flushing after `close`.
    pub close_linger: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            write_timeout: None,
            close_linger: DEFAULT_CLOSE_LINGER,
        }
    }
}

/// Queue receiver and write half, handed to the writer task when it starts.
type Outbound = (mpsc::Receiver<Message>, FrameWriter<BoxedWriter>);

/// A single client connection.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: AtomicU8,
    /// Set by whichever caller claims the write half first
    /// (the writer task, or `close` when no writer ever ran).
    writer_started: AtomicBool,
    close_claimed: AtomicBool,
    writer_done: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    outbound: Mutex<Option<Outbound>>,
    broken: Notify,
    closing: Notify,
    write_timeout: Option<Duration>,
    close_linger: Duration,
}

impl Connection {
    /// Create a connection around the write half of a stream.
    pub fn new<W>(peer: SocketAddr, writer: W, options: &ConnectionOptions) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(options.outbound_capacity.max(1));
        let writer: BoxedWriter = Box::new(writer);

        Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            state: AtomicU8::new(OPEN),
            writer_started: AtomicBool::new(false),
            close_claimed: AtomicBool::new(false),
            writer_done: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
            outbound: Mutex::new(Some((rx, FrameWriter::new(writer)))),
            broken: Notify::new(),
            closing: Notify::new(),
            write_timeout: options.write_timeout,
            close_linger: options.close_linger,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => ConnState::Open,
            CLOSING => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Queue a message for this connection's writer.
    ///
    /// Starts the writer task on first use. Waits while the queue is full.
    /// Fails with [`NodeError::ConnectionClosed`] once the connection has
    /// left the `Open` state.
    pub async fn enqueue(self: &Arc<Self>, message: Message) -> Result<()> {
        if !self.is_open() {
            return Err(NodeError::ConnectionClosed);
        }
        self.start_writer();

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NodeError::ConnectionClosed)?;

        sender
            .send(message)
            .await
            .map_err(|_| NodeError::ConnectionClosed)
    }

    /// Spawn the writer task unless it was already claimed.
    ///
    /// Returns true only for the call that spawned it.
    pub(crate) fn start_writer(self: &Arc<Self>) -> bool {
        if self
            .writer_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match outbound {
            Some((rx, writer)) => {
                trace!(conn = %self.id, "Starting writer task");
                tokio::spawn(write_loop(Arc::clone(self), rx, writer));
                true
            }
            None => false,
        }
    }

    /// Resolves once the writer task has failed.
    pub async fn broken(&self) {
        self.broken.notified().await
    }

    fn mark_broken(&self) {
        let _ = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire);
        self.broken.notify_one();
    }

    /// Called by the writer task once it has let go of the write half.
    fn writer_finished(&self) {
        self.writer_done.store(true, Ordering::SeqCst);
        if self.close_claimed.load(Ordering::SeqCst) {
            self.state.store(CLOSED, Ordering::SeqCst);
        }
    }

    /// Release the outbound queue and the write half.
    ///
    /// A running writer may flush already queued messages for up to
    /// `close_linger`, then it is stopped even if the peer is not reading.
    /// The state becomes `Closed` once the write half is gone. Only the
    /// first call does anything; it returns true.
    pub async fn close(&self) -> bool {
        if self.close_claimed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.store(CLOSING, Ordering::SeqCst);

        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        // No writer ever ran: shut the write half down here.
        if self
            .writer_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let outbound = self
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some((_rx, mut writer)) = outbound {
                if let Err(e) = writer.shutdown().await {
                    debug!(conn = %self.id, error = %e, "Shutdown of idle writer failed");
                }
            }
            self.state.store(CLOSED, Ordering::SeqCst);
            return true;
        }

        self.closing.notify_one();
        if self.writer_done.load(Ordering::SeqCst) {
            self.state.store(CLOSED, Ordering::SeqCst);
        }
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

enum WriteStep {
    Written,
    Drained,
    Failed,
}

/// Drain the outbound queue in FIFO order.
async fn write_loop(
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Message>,
    writer: FrameWriter<BoxedWriter>,
) {
    drain(&conn, rx, writer).await;
    conn.writer_finished();
}

async fn drain(
    conn: &Connection,
    mut rx: mpsc::Receiver<Message>,
    mut writer: FrameWriter<BoxedWriter>,
) {
    let linger = async {
        conn.closing.notified().await;
        tokio::time::sleep(conn.close_linger).await;
    };
    tokio::pin!(linger);

    loop {
        let step = tokio::select! {
            step = write_next(conn, &mut rx, &mut writer) => step,
            _ = &mut linger => {
                debug!(conn = %conn.id, peer = %conn.peer, "Close linger expired, dropping writer");
                return;
            }
        };

        match step {
            WriteStep::Written => {}
            WriteStep::Failed => {
                conn.mark_broken();
                return;
            }
            WriteStep::Drained => break,
        }
    }

    debug!(conn = %conn.id, peer = %conn.peer, "Outbound queue closed");
    if let Err(e) = writer.shutdown().await {
        debug!(conn = %conn.id, error = %e, "Writer shutdown failed");
    }
}

async fn write_next(
    conn: &Connection,
    rx: &mut mpsc::Receiver<Message>,
    writer: &mut FrameWriter<BoxedWriter>,
) -> WriteStep {
    let Some(message) = rx.recv().await else {
        return WriteStep::Drained;
    };

    let result = match conn.write_timeout {
        Some(deadline) => {
            match tokio::time::timeout(deadline, writer.write_message(&message)).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout),
            }
        }
        None => writer.write_message(&message).await,
    };

    match result {
        Ok(()) => {
            trace!(conn = %conn.id, command = %message.command_str(), "Message written");
            WriteStep::Written
        }
        // Nothing was written; the stream is still usable.
        Err(NodeError::Frame(e)) => {
            warn!(conn = %conn.id, command = %message.command_str(), error = %e, "Dropping unframeable message");
            WriteStep::Written
        }
        Err(e) => {
            error!(conn = %conn.id, peer = %conn.peer, error = %e, "Failed to write message");
            WriteStep::Failed
        }
    }
}
