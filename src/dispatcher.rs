//! Command routing.
//!
//! The dispatcher maps command names to handlers and routes every inbound
//! message. A message that carries the correlation id and the command of
//! an outstanding request on the same connection completes that request
//! instead of being routed by name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::codec::Message;
use crate::connection::{Connection, ConnectionId};
use crate::error::{NodeError, Result};
use crate::handlers;
use crate::registry::Registry;

/// Reserved fallback command name.
pub const DEFAULT_COMMAND: &str = "default";

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler gets to work with.
#[derive(Clone)]
pub struct HandlerContext {
    pub conn: Arc<Connection>,
    pub registry: Arc<Registry>,
}

impl HandlerContext {
    pub fn new(conn: Arc<Connection>, registry: Arc<Registry>) -> Self {
        Self { conn, registry }
    }

    /// Queue a message back to the sender of the message being handled.
    pub async fn reply(&self, message: Message) -> Result<()> {
        self.conn.enqueue(message).await
    }
}

/// A command handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: HandlerContext, message: Message) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: HandlerContext, message: Message) -> BoxFuture<'static, ()> {
        Box::pin(self(ctx, message))
    }
}

/// Completion slot for an outstanding request.
struct Pending {
    conn: ConnectionId,
    command: Bytes,
    tx: oneshot::Sender<Message>,
}

impl Pending {
    /// Replies keep the command of the request they answer, so a peer's
    /// own request that happens to reuse the id is not taken as a reply.
    fn answered_by(&self, conn: ConnectionId, message: &Message) -> bool {
        self.conn == conn && self.command == message.command
    }
}

/// Routes inbound messages to registered handlers.
pub struct Dispatcher {
    commands: RwLock<HashMap<String, Arc<dyn Handler>>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_correlation: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with `alive` and the OK-echo `default` handler.
    pub fn new() -> Self {
        let dispatcher = Self {
            commands: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
        };
        dispatcher.set_command(handlers::ALIVE, handlers::liveness);
        dispatcher.set_command(DEFAULT_COMMAND, handlers::default_echo);
        dispatcher
    }

    /// Register or replace the handler for `name`.
    pub fn set_command<H: Handler>(&self, name: &str, handler: H) {
        let mut commands = self
            .commands
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if commands.insert(name.to_string(), Arc::new(handler)).is_some() {
            debug!(command = name, "Handler replaced");
        }
    }

    /// Look up the handler for `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Route one inbound message.
    pub async fn dispatch(&self, ctx: HandlerContext, message: Message) {
        if message.correlation_id != 0 {
            if let Some(pending) = self.take_reply_slot(ctx.conn.id(), &message) {
                trace!(correlation_id = message.correlation_id, "Reply matched pending request");
                // The waiter may have timed out and gone away.
                let _ = pending.tx.send(message);
                return;
            }
        }

        let command = message.command_str().into_owned();
        let handler = match self.lookup(&command) {
            Some(handler) => handler,
            None => match self.lookup(DEFAULT_COMMAND) {
                Some(handler) => handler,
                None => {
                    warn!(command = %command, "No handler and no default handler, dropping message");
                    return;
                }
            },
        };

        trace!(conn = %ctx.conn.id(), command = %command, "Dispatching");
        handler.call(ctx, message).await;
    }

    /// Send `request` and run `on_reply` when its reply arrives.
    ///
    /// The request gets a fresh correlation id, so several requests with
    /// the same command can be outstanding at once.
    pub async fn execute<H: Handler>(
        &self,
        ctx: HandlerContext,
        request: Message,
        on_reply: H,
    ) -> Result<()> {
        let (_, rx) = self.send_request(&ctx.conn, request).await?;
        tokio::spawn(async move {
            match rx.await {
                Ok(reply) => on_reply.call(ctx, reply).await,
                Err(_) => debug!(conn = %ctx.conn.id(), "Request abandoned before reply"),
            }
        });
        Ok(())
    }

    /// Send `request` and wait up to `timeout` for the matching reply.
    pub async fn request(
        &self,
        conn: &Arc<Connection>,
        request: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let (correlation_id, rx) = self.send_request(conn, request).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NodeError::ConnectionClosed),
            Err(_) => {
                self.take_pending(correlation_id, conn.id());
                Err(NodeError::Timeout)
            }
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending_map().len()
    }

    async fn send_request(
        &self,
        conn: &Arc<Connection>,
        request: Message,
    ) -> Result<(u64, oneshot::Receiver<Message>)> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(
            correlation_id,
            Pending {
                conn: conn.id(),
                command: request.command.clone(),
                tx,
            },
        );

        if let Err(e) = conn.enqueue(request.with_correlation(correlation_id)).await {
            self.take_pending(correlation_id, conn.id());
            return Err(e);
        }
        Ok((correlation_id, rx))
    }

    /// Drop outstanding requests addressed to `conn`; their waiters see
    /// the connection as closed.
    pub fn cancel_pending(&self, conn: ConnectionId) -> usize {
        let mut pending = self.pending_map();
        let before = pending.len();
        pending.retain(|_, p| p.conn != conn);
        before - pending.len()
    }

    /// Remove the pending entry for `correlation_id` if it belongs to `conn`.
    fn take_pending(&self, correlation_id: u64, conn: ConnectionId) -> Option<Pending> {
        let mut pending = self.pending_map();
        match pending.get(&correlation_id) {
            Some(p) if p.conn == conn => pending.remove(&correlation_id),
            _ => None,
        }
    }

    fn take_reply_slot(&self, conn: ConnectionId, message: &Message) -> Option<Pending> {
        let mut pending = self.pending_map();
        match pending.get(&message.correlation_id) {
            Some(p) if p.answered_by(conn, message) => pending.remove(&message.correlation_id),
            _ => None,
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameReader;
    use crate::connection::ConnectionOptions;
    use tokio::io::DuplexStream;

    fn context() -> (HandlerContext, FrameReader<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(
            "127.0.0.1:6000".parse().unwrap(),
            local,
            &ConnectionOptions::default(),
        );
        (
            HandlerContext::new(conn, Registry::new()),
            FrameReader::new(remote),
        )
    }

    fn recorder(
        dispatcher: &Dispatcher,
        name: &str,
    ) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.set_command(name, move |_ctx: HandlerContext, msg: Message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(msg);
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_builtin_alive() {
        let dispatcher = Dispatcher::new();
        let (ctx, mut remote) = context();

        dispatcher.dispatch(ctx, Message::new("alive", "")).await;

        let reply = remote.read_message().await.unwrap();
        assert_eq!(reply.command, "alive");
        assert_eq!(reply.body, "OK");
    }

    #[tokio::test]
    async fn test_unknown_command_goes_to_default_once() {
        let dispatcher = Dispatcher::new();
        let seen = recorder(&dispatcher, DEFAULT_COMMAND);
        let (ctx, _remote) = context();

        let msg = Message::new("no-such-command", "payload");
        dispatcher.dispatch(ctx, msg.clone()).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], msg);
    }

    #[tokio::test]
    async fn test_set_command_replaces_handler() {
        let dispatcher = Dispatcher::new();
        let first = recorder(&dispatcher, "job");
        let second = recorder(&dispatcher, "job");
        let (ctx, _remote) = context();

        dispatcher.dispatch(ctx, Message::new("job", "")).await;

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_lookup() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.lookup("alive").is_some());
        assert!(dispatcher.lookup(DEFAULT_COMMAND).is_some());
        assert!(dispatcher.lookup("register").is_none());
    }

    #[tokio::test]
    async fn test_execute_correlates_same_command_requests() {
        let dispatcher = Dispatcher::new();
        let (ctx, mut remote) = context();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for tag in ["first", "second"] {
            let tx = tx.clone();
            dispatcher
                .execute(ctx.clone(), Message::new("work", ""), move |_ctx: HandlerContext, reply: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((tag, reply.body));
                    }
                })
                .await
                .unwrap();
        }

        let req1 = remote.read_message().await.unwrap();
        let req2 = remote.read_message().await.unwrap();
        assert_ne!(req1.correlation_id, req2.correlation_id);

        // Answer out of order.
        dispatcher.dispatch(ctx.clone(), req2.reply("for-second")).await;
        dispatcher.dispatch(ctx.clone(), req1.reply("for-first")).await;

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort_by_key(|(tag, _)| *tag);
        assert_eq!(got[0].0, "first");
        assert_eq!(got[0].1, "for-first");
        assert_eq!(got[1].0, "second");
        assert_eq!(got[1].1, "for-second");
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_returns_reply() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (ctx, mut remote) = context();

        let requester = {
            let dispatcher = Arc::clone(&dispatcher);
            let conn = Arc::clone(&ctx.conn);
            tokio::spawn(async move {
                dispatcher
                    .request(&conn, Message::new("status", ""), Duration::from_secs(5))
                    .await
            })
        };

        let req = remote.read_message().await.unwrap();
        dispatcher.dispatch(ctx, req.reply("ready")).await;

        let reply = requester.await.unwrap().unwrap();
        assert_eq!(reply.body, "ready");
    }

    #[tokio::test]
    async fn test_request_timeout_releases_slot() {
        let dispatcher = Dispatcher::new();
        let (ctx, _remote) = context();

        let result = dispatcher
            .request(&ctx.conn, Message::new("status", ""), Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(NodeError::Timeout)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_fails_waiter() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (ctx, mut remote) = context();

        let requester = {
            let dispatcher = Arc::clone(&dispatcher);
            let conn = Arc::clone(&ctx.conn);
            tokio::spawn(async move {
                dispatcher
                    .request(&conn, Message::new("status", ""), Duration::from_secs(5))
                    .await
            })
        };

        remote.read_message().await.unwrap();
        assert_eq!(dispatcher.cancel_pending(ctx.conn.id()), 1);

        assert!(matches!(
            requester.await.unwrap(),
            Err(NodeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reply_from_other_connection_is_routed_normally() {
        let dispatcher = Dispatcher::new();
        let seen = recorder(&dispatcher, "status");
        let (ctx, mut remote) = context();
        let (other, _other_remote) = context();

        dispatcher
            .execute(ctx.clone(), Message::new("status", ""), |_ctx: HandlerContext, _msg: Message| async {})
            .await
            .unwrap();
        let req = remote.read_message().await.unwrap();

        dispatcher.dispatch(other, req.reply("spoofed")).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_request_reusing_pending_id_is_dispatched() {
        let dispatcher = Dispatcher::new();
        let (ctx, mut remote) = context();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        dispatcher
            .execute(ctx.clone(), Message::new("status", ""), move |_ctx: HandlerContext, reply: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(reply);
                }
            })
            .await
            .unwrap();
        let req = remote.read_message().await.unwrap();

        // The peer's own `alive` request happens to carry the same id.
        let alive = Message::new("alive", "").with_correlation(req.correlation_id);
        dispatcher.dispatch(ctx.clone(), alive).await;

        let reply = tokio::time::timeout(Duration::from_secs(1), remote.read_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.command, "alive");
        assert_eq!(reply.body, "OK");
        assert_eq!(reply.correlation_id, req.correlation_id);
        assert_eq!(dispatcher.pending_count(), 1);
        assert!(rx.try_recv().is_err());

        // The real reply still completes the request.
        dispatcher.dispatch(ctx, req.reply("up")).await;
        assert_eq!(rx.recv().await.unwrap().body, "up");
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_on_closed_connection_fails() {
        let dispatcher = Dispatcher::new();
        let (ctx, _remote) = context();
        ctx.conn.close().await;

        let result = dispatcher
            .execute(ctx, Message::new("status", ""), |_ctx: HandlerContext, _msg: Message| async {})
            .await;

        assert!(matches!(result, Err(NodeError::ConnectionClosed)));
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
