use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::connection::dual::{DualConnection, UdpBinding};
use crate::connection::Connection;


#[derive(Default)]
struct Inner {
    by_id: FxHashMap<u64, Arc<DualConnection>>,
    by_token: FxHashMap<u32, u64>,
    by_endpoint: FxHashMap<SocketAddr, u64>,
}

/// All live sessions, addressable by connection ID, UDP token and bound UDP endpoint
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Default::default()
    }

    pub fn add(&self, conn: Arc<DualConnection>) {
        let mut inner = self.inner.write();
        inner.by_token.insert(conn.token(), conn.id());
        inner.by_id.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<DualConnection>> {
        let mut inner = self.inner.write();
        let conn = inner.by_id.remove(&id)?;
        if inner.by_token.get(&conn.token()) == Some(&id) {
            inner.by_token.remove(&conn.token());
        }
        inner.by_endpoint.retain(|_, conn_id| *conn_id != id);
        Some(conn)
    }

    pub fn get(&self, id: u64) -> Option<Arc<DualConnection>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn by_token(&self, token: u32) -> Option<Arc<DualConnection>> {
        let inner = self.inner.read();
        inner.by_token.get(&token)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn by_endpoint(&self, endpoint: SocketAddr) -> Option<Arc<DualConnection>> {
        let inner = self.inner.read();
        inner.by_endpoint.get(&endpoint)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn by_uid(&self, uid: &str) -> Vec<Arc<DualConnection>> {
        self.inner.read().by_id.values()
            .filter(|c| c.uid() == uid)
            .cloned()
            .collect()
    }

    /// Binds a connection's datagram channel to an endpoint. If another connection was bound to
    ///  the same endpoint, that connection loses its datagram channel.
    pub fn bind_endpoint(&self, conn: &Arc<DualConnection>, binding: UdpBinding) {
        let endpoint = binding.endpoint;
        let mut inner = self.inner.write();

        if let Some(&other_id) = inner.by_endpoint.get(&endpoint) {
            if other_id != conn.id() {
                if let Some(other) = inner.by_id.get(&other_id) {
                    info!(uid = other.uid(), %endpoint, "endpoint was taken over by connection {}", conn.uid());
                    other.unbind_udp();
                }
            }
        }

        if let Some(previous) = conn.bind_udp(binding) {
            if previous != endpoint {
                inner.by_endpoint.remove(&previous);
            }
        }
        inner.by_endpoint.insert(endpoint, conn.id());
    }

    pub fn unbind_endpoint(&self, conn: &DualConnection) {
        let mut inner = self.inner.write();
        if let Some(endpoint) = conn.unbind_udp() {
            if inner.by_endpoint.get(&endpoint) == Some(&conn.id()) {
                inner.by_endpoint.remove(&endpoint);
            }
            debug!(uid = conn.uid(), %endpoint, "endpoint released");
        }
    }

    pub fn all(&self) -> Vec<Arc<DualConnection>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}
