//! Discovery
//!
//! UDP rendezvous for one document name. A node announces `Find` with its
//! listen port; every other node editing the same document connects back,
//! and the announcer keeps the first connection it accepts. The announcer
//! also hears its own `Find`, which tells it the address peers see it at.

use crate::network::beacon::{is_local_address, Beacon};
use crate::network::codec::{decode_announcement, encode_announcement};
use crate::network::config::NetworkConfig;
use crate::network::error::NetworkError;
use crate::network::link::InboundEvent;
use crate::network::packet::{Announcement, Packet};
use crate::network::peer::PeerId;
use crate::network::pool::LinkPool;
use crate::network::shutdown::ShutdownController;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Discovery for one document within one session.
pub struct Discovery {
    document: String,
    beacon: Arc<dyn Beacon>,
    pool: Arc<LinkPool>,
    config: NetworkConfig,
    own_id: watch::Sender<Option<PeerId>>,
    shutdown: ShutdownController,
    events: mpsc::UnboundedSender<InboundEvent>,
}

impl Discovery {
    /// Create discovery for `document` and start its background listener.
    pub fn start(
        document: impl Into<String>,
        beacon: Arc<dyn Beacon>,
        pool: Arc<LinkPool>,
        config: NetworkConfig,
        shutdown: ShutdownController,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Arc<Self> {
        beacon.discard_pending();
        let (own_id, _) = watch::channel(None);
        let discovery = Arc::new(Self {
            document: document.into(),
            beacon,
            pool,
            config,
            own_id,
            shutdown,
            events,
        });

        let listener = discovery.clone();
        discovery.shutdown.spawn(listener.listen());
        discovery
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Our own identity, once our `Find` echo has been observed.
    pub fn own_id(&self) -> Option<PeerId> {
        *self.own_id.borrow()
    }

    /// Announce ourselves and wait for one existing peer to connect.
    ///
    /// Returns false when nobody answered within `find_timeout`, meaning we
    /// are the first owner of the document. Connections still waiting
    /// afterwards are rejected so exactly one neighbour attaches.
    ///
    /// Our own echo must be observed before any connect-back is accepted;
    /// if it never arrives no link is committed and the queued connections
    /// are dropped unanswered.
    pub async fn find_peer(&self) -> Result<bool, NetworkError> {
        let find = Announcement::find(self.document.clone(), self.pool.listen_port());
        self.beacon.announce(&encode_announcement(&find)?).await?;
        tracing::debug!("sent Find for document '{}'", self.document);

        if let Err(e) = self.resolve_self().await {
            let rejected = self.pool.reject_pending().await;
            tracing::warn!(
                "own Find echo never arrived, dropped {} connect-backs",
                rejected
            );
            return Err(e);
        }

        let joined = self.pool.accept_pending(self.config.find_timeout).await;
        let rejected = self.pool.reject_pending().await;
        if rejected > 0 {
            tracing::debug!("rejected {} surplus connect-backs", rejected);
        }

        if joined {
            tracing::info!("joined existing session for '{}'", self.document);
        } else {
            tracing::info!("no peer answered, first owner of '{}'", self.document);
        }
        Ok(joined)
    }

    /// Wait until our own `Find` echo reveals our address.
    pub async fn resolve_self(&self) -> Result<PeerId, NetworkError> {
        let timeout = self.config.own_address_timeout;
        let mut rx = self.own_id.subscribe();
        let resolved = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(id)) => *id,
            _ => None,
        };
        resolved.ok_or(NetworkError::OwnAddressUnresolved(timeout))
    }

    /// Tell every node on the document that `dead` is gone and we repair.
    pub async fn announce_peer_died(&self, dead: PeerId, repair: PeerId) -> Result<(), NetworkError> {
        let announcement = Announcement::peer_died(self.document.clone(), dead, repair);
        self.beacon.announce(&encode_announcement(&announcement)?).await?;
        tracing::debug!("announced PeerDied for {}", dead);
        Ok(())
    }

    async fn listen(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.beacon.recv() => match received {
                    Ok((datagram, source)) => self.handle_datagram(&datagram, source),
                    Err(e) => {
                        tracing::warn!("discovery listener stopped: {}", e);
                        break;
                    }
                }
            }
        }
        tracing::debug!("discovery listener for '{}' stopped", self.document);
    }

    fn handle_datagram(self: &Arc<Self>, datagram: &[u8], source: SocketAddr) {
        let announcement = match decode_announcement(datagram) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::debug!("ignoring datagram from {}: {}", source, e);
                return;
            }
        };
        if announcement.document != self.document {
            return;
        }

        match announcement.packet {
            Packet::Find { listen_port } => self.on_find(source, listen_port),
            Packet::PeerDied { dead, repair } => {
                let _ = self.events.send(InboundEvent::PeerDied { dead, repair });
            }
            other => {
                tracing::warn!("unexpected {} on discovery channel", other.kind());
            }
        }
    }

    fn on_find(self: &Arc<Self>, source: SocketAddr, listen_port: u16) {
        let peer = PeerId::new(source.ip(), listen_port);

        if listen_port == self.pool.listen_port() && is_local_address(source.ip()) {
            let learned = self.own_id.send_if_modified(|own| {
                if own.is_none() {
                    *own = Some(peer);
                    true
                } else {
                    false
                }
            });
            if learned {
                tracing::info!("own address is {}", peer);
            }
            return;
        }

        let pool = self.pool.clone();
        let shutdown = self.shutdown.clone();
        self.shutdown.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = pool.connect_to(peer) => match result {
                    Ok(_) => tracing::info!("connected back to new peer {}", peer),
                    Err(e) => tracing::debug!("connect-back to {} failed: {}", peer, e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::beacon::BeaconHub;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn config(base: u16) -> NetworkConfig {
        NetworkConfig::new()
            .listen_base_port(base)
            .find_timeout(Duration::from_millis(300))
            .handshake_timeout(Duration::from_millis(300))
            .own_address_timeout(Duration::from_millis(500))
    }

    struct Node {
        discovery: Arc<Discovery>,
        pool: Arc<LinkPool>,
        shutdown: ShutdownController,
        events: mpsc::UnboundedReceiver<InboundEvent>,
    }

    async fn node(hub: &BeaconHub, document: &str, base: u16) -> Node {
        let (tx, events) = mpsc::unbounded_channel();
        let pool = Arc::new(LinkPool::listen(config(base), tx.clone()).await.unwrap());
        let shutdown = ShutdownController::new();
        let discovery = Discovery::start(
            document,
            hub.endpoint(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            pool.clone(),
            config(base),
            shutdown.clone(),
            tx,
        );
        Node { discovery, pool, shutdown, events }
    }

    async fn stop(node: Node) {
        node.shutdown.shutdown();
        node.pool.close().await;
        node.shutdown.join_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_first_owner_resolves_itself() {
        let hub = BeaconHub::new();
        let a = node(&hub, "notes", 25200).await;

        assert!(!a.discovery.find_peer().await.unwrap());
        let id = a.discovery.resolve_self().await.unwrap();
        assert_eq!(id.port, a.pool.listen_port());
        assert_eq!(a.discovery.own_id(), Some(id));

        stop(a).await;
    }

    #[tokio::test]
    async fn test_second_node_is_joined() {
        let hub = BeaconHub::new();
        let a = node(&hub, "notes", 25300).await;
        assert!(!a.discovery.find_peer().await.unwrap());

        let b = node(&hub, "notes", 25400).await;
        assert!(b.discovery.find_peer().await.unwrap());
        b.discovery.resolve_self().await.unwrap();

        assert_eq!(b.pool.len(), 1);
        for _ in 0..50 {
            if a.pool.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.pool.len(), 1);
        assert_eq!(a.pool.peers()[0].port, b.pool.listen_port());

        stop(a).await;
        stop(b).await;
    }

    #[tokio::test]
    async fn test_other_documents_are_ignored() {
        let hub = BeaconHub::new();
        let a = node(&hub, "notes", 25500).await;
        assert!(!a.discovery.find_peer().await.unwrap());

        let b = node(&hub, "todo", 25600).await;
        assert!(!b.discovery.find_peer().await.unwrap());
        assert!(a.pool.is_empty());

        stop(a).await;
        stop(b).await;
    }

    #[tokio::test]
    async fn test_own_address_times_out_without_echo() {
        let hub = BeaconHub::new();
        let a = node(&hub, "notes", 25700).await;
        let err = a.discovery.resolve_self().await.unwrap_err();
        assert!(matches!(err, NetworkError::OwnAddressUnresolved(_)));
        stop(a).await;
    }

    /// Sends normally but never hears anything, not even itself.
    struct DeafBeacon(Arc<crate::network::beacon::MemoryBeacon>);

    #[async_trait::async_trait]
    impl Beacon for DeafBeacon {
        async fn announce(&self, datagram: &[u8]) -> std::io::Result<()> {
            self.0.announce(datagram).await
        }

        async fn recv(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_unresolved_own_address_commits_no_link() {
        let hub = BeaconHub::new();
        let a = node(&hub, "notes", 25750).await;
        assert!(!a.discovery.find_peer().await.unwrap());

        let (tx, _events) = mpsc::unbounded_channel();
        let pool = Arc::new(LinkPool::listen(config(25760), tx.clone()).await.unwrap());
        let shutdown = ShutdownController::new();
        let deaf = Arc::new(DeafBeacon(hub.endpoint(IpAddr::V4(Ipv4Addr::LOCALHOST))));
        let b = Discovery::start("notes", deaf, pool.clone(), config(25760), shutdown.clone(), tx);

        let err = b.find_peer().await.unwrap_err();
        assert!(matches!(err, NetworkError::OwnAddressUnresolved(_)));
        assert!(pool.is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(a.pool.is_empty());

        shutdown.shutdown();
        pool.close().await;
        shutdown.join_all(Duration::from_secs(1)).await;
        stop(a).await;
    }

    #[tokio::test]
    async fn test_peer_died_is_forwarded_as_event() {
        let hub = BeaconHub::new();
        let mut a = node(&hub, "notes", 25800).await;
        let other = hub.endpoint(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let dead = PeerId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        let repair = PeerId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4001);
        let datagram = encode_announcement(&Announcement::peer_died("notes", dead, repair)).unwrap();
        other.announce(&datagram).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(1), a.events.recv()).await.unwrap() {
            Some(InboundEvent::PeerDied { dead: d, repair: r }) => {
                assert_eq!(d, dead);
                assert_eq!(r, repair);
            }
            other => panic!("unexpected event {:?}", other),
        }

        stop(a).await;
    }
}
