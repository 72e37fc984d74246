//! Live peer connection registry.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::warn;

use crate::core::NodeId;
use crate::protocol::{Connection, RawConnection};

/// The set of currently connected peers, keyed by node id.
///
/// Plain data: the model guards the registry with its connection lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    proto: BTreeMap<NodeId, Arc<dyn Connection>>,
    raw: BTreeMap<NodeId, Arc<dyn RawConnection>>,
    client_version: BTreeMap<NodeId, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly handshaken connection.
    ///
    /// Panics if the peer is already registered: the surrounding code
    /// must close the old session first.
    pub fn add(&mut self, raw: Arc<dyn RawConnection>, proto: Arc<dyn Connection>) {
        let node = proto.id();
        if self.proto.contains_key(&node) || self.raw.contains_key(&node) {
            panic!("connection for node {node} already registered");
        }
        self.proto.insert(node, proto);
        self.raw.insert(node, raw);
    }

    /// Drop the peer's entry and close its transport. Idempotent.
    pub fn remove(&mut self, node: NodeId) {
        if let Some(raw) = self.raw.remove(&node)
            && let Err(err) = raw.close()
        {
            warn!(%node, "closing raw connection: {err}");
        }
        self.proto.remove(&node);
        self.client_version.remove(&node);
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<dyn Connection>> {
        self.proto.get(&node).cloned()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.proto.contains_key(&node)
    }

    pub fn remote_addr(&self, node: NodeId) -> Option<SocketAddr> {
        self.raw.get(&node).and_then(|raw| raw.remote_addr())
    }

    pub fn set_client_version(&mut self, node: NodeId, version: String) {
        self.client_version.insert(node, version);
    }

    pub fn client_version(&self, node: NodeId) -> Option<&str> {
        self.client_version.get(&node).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Arc<dyn Connection>)> {
        self.proto.iter()
    }
}
