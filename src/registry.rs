//! Shared registry of live connections and registered services.
//!
//! One instance is created at startup and handed to the server and to
//! every handler. All mutation goes through a single read/write lock that
//! is never held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::codec::Message;
use crate::connection::{Connection, ConnectionId};

/// A registered service.
///
/// `(name, host, port)` identifies a descriptor; `protocol` and `metadata`
/// are updated in place when the same key registers again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub metadata: String,
}

impl ServiceDescriptor {
    fn same_key(&self, other: &ServiceDescriptor) -> bool {
        self.name == other.name && self.host == other.host && self.port == other.port
    }
}

/// Outcome of [`Registry::upsert_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    services: Vec<ServiceDescriptor>,
}

/// Registry of connections and service descriptors.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a live connection.
    pub fn add_connection(&self, conn: &Arc<Connection>) {
        let mut state = self.write();
        state.connections.insert(conn.id(), Arc::clone(conn));
        trace!(conn = %conn.id(), total = state.connections.len(), "Connection registered");
    }

    /// Forget a connection. Removing an absent connection is a no-op.
    ///
    /// Returns true if the connection was present.
    pub fn remove_connection(&self, conn: &Arc<Connection>) -> bool {
        let mut state = self.write();
        match state.connections.get(&conn.id()) {
            Some(existing) if Arc::ptr_eq(existing, conn) => {
                state.connections.remove(&conn.id());
                true
            }
            _ => false,
        }
    }

    /// Point-in-time copy of the live connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.read().connections.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Insert a descriptor, or update protocol and metadata of the one
    /// sharing its `(name, host, port)` key.
    pub fn upsert_service(&self, descriptor: ServiceDescriptor) -> Upsert {
        let mut state = self.write();

        if let Some(existing) = state
            .services
            .iter_mut()
            .find(|existing| existing.same_key(&descriptor))
        {
            existing.protocol = descriptor.protocol;
            existing.metadata = descriptor.metadata;
            debug!(service = %existing.name, host = %existing.host, port = existing.port, "Service updated");
            return Upsert::Updated;
        }

        info!(
            service = %descriptor.name,
            host = %descriptor.host,
            port = descriptor.port,
            protocol = %descriptor.protocol,
            "Service registered"
        );
        state.services.push(descriptor);
        Upsert::Inserted
    }

    /// All descriptors named `name`, in registration order.
    pub fn find_by_name(&self, name: &str) -> Vec<ServiceDescriptor> {
        self.read()
            .services
            .iter()
            .filter(|service| service.name == name)
            .cloned()
            .collect()
    }

    pub fn service_count(&self) -> usize {
        self.read().services.len()
    }

    /// Queue `message` for every live connection.
    ///
    /// Connections that closed after the snapshot was taken are skipped.
    /// Returns how many connections accepted the message.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for conn in self.snapshot() {
            match conn.enqueue(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(conn = %conn.id(), peer = %conn.peer(), error = %e, "Broadcast skipped connection");
                }
            }
        }
        trace!(command = %message.command_str(), delivered, "Broadcast sent");
        delivered
    }
}
