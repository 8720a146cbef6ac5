use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{PollerKind, RelayConfig};
use crate::connection::dual::FlushQueues;
use crate::connection::registry::ConnectionRegistry;
use crate::connection::Connection;
use crate::data::context::DataContext;
use crate::identity::IdentityStore;
use crate::pool::ThreadPool;
use crate::roles::acceptor::AcceptorRole;
use crate::roles::handshaker::{ConnectionFeature, ExtendedHandshakeFeature, Handshaker, HandshakerRole, SessionListener, EXTENDED_HANDSHAKE_FEATURE};
use crate::roles::heartbeat::HeartbeatRole;
use crate::roles::poller::{PeekPoller, Poller};
use crate::roles::receiver::{TcpReceiverRole, UdpReceiverRole};
use crate::roles::sender::{TcpSenderRole, UdpSenderRole};
use crate::token::TokenGenerator;


/// The relay's transport core, wired together: sockets, roles and the connection registry.
///  Message semantics are the application's, registered on the [DataContext].
pub struct RelayServer {
    ctx: Arc<DataContext>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<ThreadPool>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
}

impl RelayServer {
    /// Binds the sockets and starts all roles. The UDP socket is bound to the same address as
    ///  the TCP listener, including an ephemeral port it was assigned.
    pub fn start(
        config: RelayConfig,
        ctx: Arc<DataContext>,
        identities: Arc<dyn IdentityStore>,
        mut features: Vec<Arc<dyn ConnectionFeature>>,
        listener: Arc<dyn SessionListener>,
    ) -> anyhow::Result<RelayServer> {
        config.validate()?;
        let config = Arc::new(config);

        if config.connection_features.iter().any(|f| f == EXTENDED_HANDSHAKE_FEATURE)
            && !features.iter().any(|f| f.name() == EXTENDED_HANDSHAKE_FEATURE)
        {
            features.push(Arc::new(ExtendedHandshakeFeature::new(
                ctx.clone(),
                Vec::new(),
                config.feature_handshake_timeout,
                config.extended_handshake_settle,
            )));
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let poller = new_poller(config.poller)?;
        let (flush_queues, tcp_flush_rx, udp_flush_rx) = FlushQueues::new();

        let handshaker = Arc::new(HandshakerRole::new(
            Arc::new(Handshaker {
                ctx: ctx.clone(),
                config: config.clone(),
                registry: registry.clone(),
                poller: poller.clone(),
                tokens: Arc::new(TokenGenerator::new()),
                identities,
                features,
                listener,
                flush_queues,
            }),
            config.pool.handshaker,
        ));
        let acceptor = AcceptorRole::new(config.bind_addr, config.pool.acceptor, handshaker.clone())?;
        let tcp_addr = acceptor.local_addr();
        let udp_receiver = UdpReceiverRole::new(tcp_addr, registry.clone(), config.pool.udp_receiver)?;
        let udp_addr = udp_receiver.local_addr();

        let pool = ThreadPool::new(config.pool.clone())?;
        let started = (|| {
            pool.add_role(Arc::new(HeartbeatRole::new(registry.clone(), config.clone())))?;
            pool.add_role(Arc::new(TcpSenderRole::new(tcp_flush_rx, config.pool.tcp_sender)))?;
            pool.add_role(Arc::new(UdpSenderRole::new(udp_flush_rx, config.pool.udp_sender)))?;
            pool.add_role(Arc::new(TcpReceiverRole::new(poller.clone(), config.pool.tcp_receiver)))?;
            pool.add_role(Arc::new(udp_receiver))?;
            pool.add_role(handshaker)?;
            pool.add_role(Arc::new(acceptor))?;
            pool.start_rebalancing()
        })();
        if let Err(e) = started {
            pool.dispose();
            return Err(e);
        }

        info!(%tcp_addr, %udp_addr, "relay server started");
        Ok(RelayServer {
            ctx,
            registry,
            pool,
            tcp_addr,
            udp_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn ctx(&self) -> &Arc<DataContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Stops all roles, then disposes the remaining connections. Idempotent.
    pub fn shutdown(&self) {
        if self.pool.is_disposed() {
            return;
        }
        info!("shutting down relay server");
        self.pool.dispose();

        let remaining = self.registry.all();
        debug!("disposing {} remaining connections", remaining.len());
        for conn in remaining {
            conn.dispose();
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn new_poller(kind: PollerKind) -> anyhow::Result<Arc<dyn Poller>> {
    match kind {
        #[cfg(unix)]
        PollerKind::Mio => Ok(Arc::new(crate::roles::poller::MioPoller::new()?)),
        #[cfg(not(unix))]
        PollerKind::Mio => {
            debug!("no edge-triggered poller on this platform, falling back to peeking");
            Ok(Arc::new(PeekPoller::new()?))
        }
        PollerKind::Peek => Ok(Arc::new(PeekPoller::new()?)),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::identity::NullIdentityStore;
    use crate::roles::handshaker::NoopSessionListener;
    use crate::test_util::message::test_context;
    use super::*;

    fn start(config: RelayConfig) -> anyhow::Result<RelayServer> {
        RelayServer::start(config, Arc::new(test_context()), Arc::new(NullIdentityStore), vec![], Arc::new(NoopSessionListener))
    }

    fn local_config(poller: PollerKind) -> RelayConfig {
        RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            poller,
            ..RelayConfig::default()
        }
    }

    #[rstest]
    #[case::mio(PollerKind::Mio)]
    #[case::peek(PollerKind::Peek)]
    fn test_start_and_shutdown(#[case] poller: PollerKind) {
        let server = start(local_config(poller)).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.udp_addr().port(), server.local_addr().port());
        assert_eq!(server.pool().num_workers("heartbeat"), 1);
        assert_eq!(server.pool().num_running_workers("acceptor"), 1);

        server.shutdown();
        assert!(server.pool().is_disposed());
        assert_eq!(server.pool().num_running_workers("acceptor"), 0);
        assert_eq!(server.pool().num_running_workers("udp-receiver"), 0);
        assert_eq!(server.pool().num_running_workers("handshaker"), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RelayConfig {
            max_datagram_size: 10,
            ..local_config(PollerKind::Peek)
        };
        assert!(start(config).is_err());
    }
}
