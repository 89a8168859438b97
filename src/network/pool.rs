//! Link Pool
//!
//! Owns the TCP listener and the table of live links. Every new connection
//! starts with a fixed two-step handshake in which each side writes its own
//! listen port as a 4-byte big-endian integer, so both ends can name the
//! other by its full identity rather than by an ephemeral source port.

use crate::network::config::NetworkConfig;
use crate::network::error::NetworkError;
use crate::network::link::{InboundEvent, Link};
use crate::network::peer::PeerId;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

/// How long `reject_pending` waits for each queued connection.
const PENDING_POLL: Duration = Duration::from_millis(10);

// ==================== Handshake ====================

/// Write our listen port.
pub async fn write_port(stream: &mut TcpStream, port: u16) -> std::io::Result<()> {
    stream.write_all(&u32::from(port).to_be_bytes()).await
}

/// Read the remote listen port.
pub async fn read_port(stream: &mut TcpStream) -> std::io::Result<u16> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    u16::try_from(u32::from_be_bytes(buf)).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "advertised port out of range")
    })
}

/// Set of live links plus the listener new links arrive on.
pub struct LinkPool {
    listener: RwLock<Option<TcpListener>>,
    listen_port: u16,
    links: DashMap<PeerId, Arc<Link>>,
    next_link_id: AtomicU64,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<InboundEvent>,
    config: NetworkConfig,
}

impl LinkPool {
    /// Bind the first free port at or above `config.listen_base_port`.
    pub async fn listen(
        config: NetworkConfig,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<Self, NetworkError> {
        for port in config.listen_base_port..=u16::MAX {
            let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await else {
                continue;
            };
            tracing::info!("bound link listener to port {}", port);
            return Ok(Self {
                listener: RwLock::new(Some(listener)),
                listen_port: port,
                links: DashMap::new(),
                next_link_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                events,
                config,
            });
        }
        Err(NetworkError::NoListenPort(config.listen_base_port))
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    /// Peers we currently hold a link to, in identity order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.links.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Open a link to `peer`, refusing if one already exists.
    pub async fn connect_to(&self, peer: PeerId) -> Result<Arc<Link>, NetworkError> {
        if self.contains(&peer) {
            tracing::debug!("tried to connect to {} twice", peer);
            return Err(NetworkError::DuplicateLink(peer));
        }

        tracing::debug!("connecting to {}", peer);
        let mut stream =
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(peer.socket_addr()))
                .await
                .map_err(|_| NetworkError::handshake(peer, "connect timed out"))??;

        write_port(&mut stream, self.listen_port).await?;
        let remote_port = tokio::time::timeout(self.config.handshake_timeout, read_port(&mut stream))
            .await
            .map_err(|_| NetworkError::handshake(peer, "no port received"))??;

        if remote_port != peer.port {
            return Err(NetworkError::handshake(
                peer,
                format!("port mismatch: expected {} got {}", peer.port, remote_port),
            ));
        }

        self.insert(peer, stream)
    }

    /// Accept one inbound connection within `timeout`.
    ///
    /// Returns true if a link was established.
    pub async fn accept_pending(&self, timeout: Duration) -> bool {
        match self.accept_one(timeout).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("inbound connection rejected: {}", e);
                false
            }
        }
    }

    /// Accept one inbound connection, `Ok(None)` on timeout.
    pub async fn accept_one(&self, timeout: Duration) -> Result<Option<Arc<Link>>, NetworkError> {
        let (mut stream, remote) = {
            let guard = self.listener.read().await;
            let Some(listener) = guard.as_ref() else {
                return Err(NetworkError::NotConnected);
            };
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(accepted) => accepted?,
                Err(_) => return Ok(None),
            }
        };

        let port = tokio::time::timeout(self.config.handshake_timeout, read_port(&mut stream))
            .await
            .map_err(|_| NetworkError::handshake(remote, "no port received"))??;
        let peer = PeerId::new(remote.ip(), port);

        if self.contains(&peer) {
            tracing::warn!("peer {} connected twice", peer);
            return Err(NetworkError::DuplicateLink(peer));
        }
        Self::probe_alive(&stream, peer)?;

        write_port(&mut stream, self.listen_port).await?;
        self.insert(peer, stream).map(Some)
    }

    /// A connector that timed out while its connection sat in the backlog has
    /// already closed its end; its port is still buffered, so check for EOF.
    fn probe_alive(stream: &TcpStream, peer: PeerId) -> Result<(), NetworkError> {
        let mut probe = [0u8; 1];
        match stream.try_read(&mut probe) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
            Ok(0) => Err(NetworkError::handshake(peer, "connector already gave up")),
            Ok(_) => Err(NetworkError::handshake(peer, "data before handshake completed")),
        }
    }

    /// Drop every connection waiting in the accept backlog.
    pub async fn reject_pending(&self) -> usize {
        let guard = self.listener.read().await;
        let Some(listener) = guard.as_ref() else {
            return 0;
        };

        let mut rejected = 0;
        while let Ok(Ok((stream, addr))) = tokio::time::timeout(PENDING_POLL, listener.accept()).await
        {
            tracing::debug!("rejected pending connection from {}", addr);
            drop(stream);
            rejected += 1;
        }
        rejected
    }

    fn insert(&self, peer: PeerId, stream: TcpStream) -> Result<Arc<Link>, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::NotConnected);
        }
        match self.links.entry(peer) {
            Entry::Occupied(_) => {
                tracing::warn!("duplicate link to {} dropped", peer);
                Err(NetworkError::DuplicateLink(peer))
            }
            Entry::Vacant(slot) => {
                let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
                let link = Link::start(
                    id,
                    peer,
                    stream,
                    self.events.clone(),
                    self.config.max_frame_len,
                );
                slot.insert(link.clone());
                tracing::info!("link established with {}", peer);
                Ok(link)
            }
        }
    }

    /// Send an encoded frame to every link whose peer matches `pred`.
    ///
    /// Returns the number of links the frame was queued on.
    pub fn multicast(&self, frame: &Bytes, pred: impl Fn(&PeerId) -> bool) -> usize {
        let mut sent = 0;
        for entry in self.links.iter() {
            if pred(entry.key()) && entry.value().send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Send an encoded frame to every link.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        self.multicast(frame, |_| true)
    }

    /// Send an encoded frame to one peer.
    pub fn send_to(&self, peer: &PeerId, frame: Bytes) -> Result<(), NetworkError> {
        let link = self
            .links
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or(NetworkError::LinkClosed(*peer))?;
        link.send(frame)
    }

    /// Remove the link with this id, if it is still the one registered for `peer`.
    pub fn remove_link(&self, peer: &PeerId, link_id: u64) -> Option<Arc<Link>> {
        let (_, link) = self.links.remove_if(peer, |_, link| link.id() == link_id)?;
        link.stop();
        Some(link)
    }

    /// Remove whatever link is registered for `peer`.
    pub fn remove_peer(&self, peer: &PeerId) -> Option<Arc<Link>> {
        let (_, link) = self.links.remove(peer)?;
        link.stop();
        Some(link)
    }

    /// Close the listener and every link, waiting for link tasks to return.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listener.write().await.take();

        let peers: Vec<PeerId> = self.links.iter().map(|entry| *entry.key()).collect();
        for peer in peers {
            if let Some((_, link)) = self.links.remove(&peer) {
                link.close().await;
            }
        }
    }
}
