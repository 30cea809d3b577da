//! Built-in command handlers.
//!
//! `alive` and `default` are installed by [`Dispatcher::new`]; [`install`]
//! adds the service-discovery commands and swaps the default handler for
//! the unknown-command reply.

use tracing::{debug, warn};

use crate::codec::{Message, MAX_BODY_LEN};
use crate::dispatcher::{Dispatcher, HandlerContext, DEFAULT_COMMAND};
use crate::registry::{ServiceDescriptor, Upsert};

pub const ALIVE: &str = "alive";
pub const REGISTER: &str = "register";
pub const DISCOVER: &str = "discover";
pub const KEEPALIVE: &str = "keepalive";
pub const CONNECTION_CLOSED: &str = "connection_closed";

/// Positive acknowledgment body.
pub const OK: &str = "OK";

/// Body sent back for commands nobody handles.
pub const UNKNOWN_COMMAND_ERR: &str = "unknown command";

/// Wire the service-discovery handlers into `dispatcher`.
pub fn install(dispatcher: &Dispatcher) {
    dispatcher.set_command(REGISTER, register);
    dispatcher.set_command(DISCOVER, discover);
    dispatcher.set_command(KEEPALIVE, keepalive);
    dispatcher.set_command(DEFAULT_COMMAND, unknown_command);
}

async fn send(ctx: &HandlerContext, message: Message) {
    if let Err(e) = ctx.reply(message).await {
        debug!(conn = %ctx.conn.id(), error = %e, "Reply not sent");
    }
}

pub async fn liveness(ctx: HandlerContext, message: Message) {
    send(&ctx, Message::new(ALIVE, OK).with_correlation(message.correlation_id)).await;
}

pub async fn default_echo(ctx: HandlerContext, message: Message) {
    send(
        &ctx,
        Message::new(DEFAULT_COMMAND, OK).with_correlation(message.correlation_id),
    )
    .await;
}

/// Record the descriptor in the body, then echo the message back.
///
/// A body that is not a valid descriptor is logged and dropped without
/// any reply.
pub async fn register(ctx: HandlerContext, message: Message) {
    let descriptor: ServiceDescriptor = match serde_json::from_slice(&message.body) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(
                peer = %ctx.conn.peer(),
                error = %e,
                body = %String::from_utf8_lossy(&message.body),
                "Dropping malformed register request"
            );
            return;
        }
    };

    if ctx.registry.upsert_service(descriptor) == Upsert::Inserted {
        debug!(peer = %ctx.conn.peer(), services = ctx.registry.service_count(), "New service entry");
    }
    keepalive(ctx, message).await;
}

/// Reply with the JSON list of services named by the body.
pub async fn discover(ctx: HandlerContext, mut message: Message) {
    let name = match std::str::from_utf8(&message.body) {
        Ok(name) => name,
        Err(e) => {
            warn!(peer = %ctx.conn.peer(), error = %e, "Dropping discover request with non-UTF-8 name");
            return;
        }
    };

    let services = ctx.registry.find_by_name(name);
    let body = match serde_json::to_vec(&services) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to encode discover reply");
            return;
        }
    };
    if body.len() > MAX_BODY_LEN {
        warn!(
            peer = %ctx.conn.peer(),
            service = name,
            matches = services.len(),
            bytes = body.len(),
            "Discover reply exceeds frame limit, dropping"
        );
        return;
    }

    message.set_body(body);
    send(&ctx, message).await;
}

pub async fn keepalive(ctx: HandlerContext, message: Message) {
    send(&ctx, message).await;
}

pub async fn unknown_command(ctx: HandlerContext, mut message: Message) {
    debug!(command = %message.command_str(), "Unknown command");
    message.set_body(UNKNOWN_COMMAND_ERR);
    send(&ctx, message).await;
}
