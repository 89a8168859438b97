//! Discovery Beacons
//!
//! The datagram channel discovery announcements travel on. [`UdpBeacon`]
//! broadcasts on the LAN; [`BeaconHub`] hands out in-memory endpoints that
//! behave like one shared broadcast domain, for running several nodes in
//! one process.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

/// Largest datagram a beacon will deliver.
pub const MAX_DATAGRAM: usize = 65_507;

/// A broadcast datagram channel.
///
/// `recv` must be cancel safe: the discovery listener races it against
/// shutdown.
#[async_trait]
pub trait Beacon: Send + Sync {
    /// Send one datagram to every listener, including ourselves.
    async fn announce(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receive the next datagram and its source address.
    async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)>;

    /// Drop datagrams that arrived while nobody was listening.
    fn discard_pending(&self) {}
}

/// Whether `ip` belongs to one of this host's interfaces.
pub fn is_local_address(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    std::net::UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

// ==================== UDP ====================

/// LAN broadcast beacon.
///
/// The socket sets SO_REUSEADDR (and SO_REUSEPORT on unix) so that every
/// node on a host can bind the shared broadcast port.
pub struct UdpBeacon {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpBeacon {
    /// Bind `port` on all interfaces and broadcast to `broadcast_addr:port`.
    pub fn bind(broadcast_addr: IpAddr, port: u16) -> io::Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        tracing::info!("discovery beacon listening on udp port {}", port);
        Ok(Self {
            socket,
            target: SocketAddr::new(broadcast_addr, port),
        })
    }
}

#[async_trait]
impl Beacon for UdpBeacon {
    async fn announce(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.target).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, source) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, source))
    }

    fn discard_pending(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut discarded = 0;
        while self.socket.try_recv_from(&mut buf).is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!("discarded {} stale datagrams", discarded);
        }
    }
}

// ==================== In-memory ====================

#[derive(Debug, Clone)]
struct Datagram {
    sender: u64,
    source: SocketAddr,
    payload: Arc<[u8]>,
}

/// Shared in-memory broadcast domain.
#[derive(Clone)]
pub struct BeaconHub {
    tx: broadcast::Sender<Datagram>,
    next_id: Arc<AtomicU64>,
}

impl BeaconHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create an endpoint whose datagrams appear to come from `address`.
    pub fn endpoint(&self, address: IpAddr) -> Arc<MemoryBeacon> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryBeacon {
            id,
            source: SocketAddr::new(address, 1337),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            muted: AtomicBool::new(false),
        })
    }
}

impl Default for BeaconHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`BeaconHub`].
pub struct MemoryBeacon {
    id: u64,
    source: SocketAddr,
    tx: broadcast::Sender<Datagram>,
    rx: Mutex<broadcast::Receiver<Datagram>>,
    muted: AtomicBool,
}

impl MemoryBeacon {
    /// Stop (or resume) receiving datagrams from other endpoints.
    ///
    /// The endpoint still hears its own announcements.
    pub fn mute_inbound(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }
}

#[async_trait]
impl Beacon for MemoryBeacon {
    async fn announce(&self, datagram: &[u8]) -> io::Result<()> {
        let datagram = Datagram {
            sender: self.id,
            source: self.source,
            payload: Arc::from(datagram),
        };
        // No receivers only means nobody is listening yet.
        let _ = self.tx.send(datagram);
        Ok(())
    }

    async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(datagram) => {
                    if datagram.sender != self.id && self.muted.load(Ordering::SeqCst) {
                        continue;
                    }
                    return Ok((datagram.payload.to_vec(), datagram.source));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("beacon endpoint lagged, {} datagrams lost", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "beacon hub closed"));
                }
            }
        }
    }

    fn discard_pending(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            *rx = rx.resubscribe();
        }
    }
}
