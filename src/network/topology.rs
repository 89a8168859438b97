//! Overlay Topology
//!
//! Keeps the links of all nodes forming a spanning tree and repairs it when
//! a node disappears. The only failure detector is a link failure. When one
//! is seen:
//!
//! 1. the neighbour announces `PeerDied { dead, repair: self }`;
//! 2. every other neighbour of the dead node drops its own link to it,
//!    joins the repair and announces the same;
//! 3. after a short settle delay each participant elects the smallest
//!    announcing peer as master;
//! 4. the master accepts connections for the repair window while the others
//!    connect to it;
//! 5. flood packets issued during the repair are held back and flushed in
//!    order once the tree is whole again, and the master reports `LostPeer`.
//!
//! Only one repair runs at a time. A second failure during a repair is
//! logged and ignored.

use crate::network::codec::{check_frame_len, encode_envelope};
use crate::network::config::NetworkConfig;
use crate::network::discovery::Discovery;
use crate::network::error::NetworkError;
use crate::network::link::InboundEvent;
use crate::network::packet::{Envelope, Packet, PacketKind};
use crate::network::peer::PeerId;
use crate::network::pool::LinkPool;
use crate::network::shutdown::ShutdownController;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

/// An in-progress repair.
#[derive(Debug)]
struct RepairState {
    dead: PeerId,
    /// Peers that announced they are repairing `dead`; the smallest is master
    candidates: BTreeSet<PeerId>,
    /// Flood frames held back until the tree is whole, with the peer to skip
    buffered: Vec<(Bytes, Option<PeerId>)>,
}

impl RepairState {
    fn new(dead: PeerId, candidates: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            dead,
            candidates: candidates.into_iter().collect(),
            buffered: Vec::new(),
        }
    }
}

/// The tree overlay of one session.
pub struct Overlay {
    self_id: PeerId,
    pool: Arc<LinkPool>,
    discovery: Arc<Discovery>,
    config: NetworkConfig,
    shutdown: ShutdownController,
    events: mpsc::UnboundedSender<InboundEvent>,
    repair: Mutex<Option<RepairState>>,
}

impl Overlay {
    pub fn new(
        self_id: PeerId,
        pool: Arc<LinkPool>,
        discovery: Arc<Discovery>,
        config: NetworkConfig,
        shutdown: ShutdownController,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            pool,
            discovery,
            config,
            shutdown,
            events,
            repair: Mutex::new(None),
        })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Whether a repair is in progress.
    pub fn in_repair(&self) -> bool {
        self.repair.lock().is_some()
    }

    /// Peers we hold a direct link to.
    pub fn link_peers(&self) -> Vec<PeerId> {
        self.pool.peers()
    }

    // ==================== Sending ====================

    /// Encode a packet we originate.
    ///
    /// Frames larger than `max_frame_len` are refused here; a peer would
    /// drop the link on reading one.
    pub fn encode(&self, packet: Packet) -> Result<Bytes, NetworkError> {
        let frame = encode_envelope(&Envelope::new(self.self_id, packet))?;
        check_frame_len(&frame, self.config.max_frame_len)?;
        Ok(frame)
    }

    /// Send a packet we originate.
    ///
    /// Flood kinds go along the tree (held back during a repair); other
    /// kinds go to every direct neighbour.
    pub fn send(&self, packet: Packet) -> Result<(), NetworkError> {
        let kind = packet.kind();
        let frame = self.encode(packet)?;
        self.send_encoded(kind, frame);
        Ok(())
    }

    /// Send a frame produced by [`Overlay::encode`].
    pub fn send_encoded(&self, kind: PacketKind, frame: Bytes) {
        if kind.is_flood() {
            self.forward(frame, None);
        } else {
            self.pool.broadcast(&frame);
        }
    }

    /// Send a packet we originate to one neighbour.
    pub fn send_to(&self, peer: &PeerId, packet: Packet) -> Result<(), NetworkError> {
        let frame = self.encode(packet)?;
        self.pool.send_to(peer, frame)
    }

    /// Flood an encoded frame to every link except `exclude`.
    pub fn forward(&self, frame: Bytes, exclude: Option<PeerId>) {
        let mut repair = self.repair.lock();
        if let Some(state) = repair.as_mut() {
            tracing::debug!("repair in progress, holding back flood frame");
            state.buffered.push((frame, exclude));
            return;
        }
        self.pool.multicast(&frame, |peer| Some(*peer) != exclude);
    }

    // ==================== Repair ====================

    /// A link reported an I/O failure.
    pub fn link_failed(self: &Arc<Self>, peer: PeerId, link_id: u64) {
        if self.pool.remove_link(&peer, link_id).is_none() {
            tracing::debug!("ignoring failure of replaced link to {}", peer);
            return;
        }

        {
            let mut repair = self.repair.lock();
            if let Some(state) = repair.as_ref() {
                if state.dead != peer {
                    tracing::error!(
                        "link to {} failed while repairing {}; concurrent repairs are not supported",
                        peer,
                        state.dead
                    );
                }
                return;
            }
            *repair = Some(RepairState::new(peer, [self.self_id]));
        }

        tracing::info!("lost link to {}, starting repair", peer);
        self.start_repair(peer);
    }

    /// Another node announced that `dead` is gone.
    pub fn on_peer_died(self: &Arc<Self>, dead: PeerId, repair_peer: PeerId) {
        if dead == self.self_id {
            tracing::warn!("{} announced us as dead, ignoring", repair_peer);
            return;
        }

        {
            let mut repair = self.repair.lock();
            if let Some(state) = repair.as_mut() {
                if state.dead == dead {
                    state.candidates.insert(repair_peer);
                } else {
                    tracing::error!(
                        "PeerDied for {} while repairing {}; concurrent repairs are not supported",
                        dead,
                        state.dead
                    );
                }
                return;
            }

            if self.pool.remove_peer(&dead).is_none() {
                return;
            }
            *repair = Some(RepairState::new(dead, [repair_peer, self.self_id]));
        }

        tracing::info!("{} reported {} dead, joining repair", repair_peer, dead);
        self.start_repair(dead);
    }

    fn start_repair(self: &Arc<Self>, dead: PeerId) {
        let overlay = self.clone();
        let span = tracing::info_span!("repair", %dead);
        self.shutdown.spawn(
            async move {
                if let Err(e) = overlay.discovery.announce_peer_died(dead, overlay.self_id).await {
                    tracing::warn!("failed to announce death of {}: {}", dead, e);
                }
                overlay.run_repair().await;
            }
            .instrument(span),
        );
    }

    async fn run_repair(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.repair_settle) => {}
        }

        let master = {
            let repair = self.repair.lock();
            match repair.as_ref().and_then(|state| state.candidates.first().copied()) {
                Some(master) => master,
                None => return,
            }
        };
        let is_master = master == self.self_id;

        if is_master {
            tracing::info!("acting as repair master");
            let deadline = Instant::now() + self.config.repair_window;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    accepted = self.pool.accept_pending(remaining) => {
                        if accepted {
                            tracing::info!("reattached peer during repair");
                        }
                    }
                }
            }
            self.pool.reject_pending().await;
        } else {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.pool.connect_to(master) => match result {
                    Ok(_) => tracing::info!("reattached to repair master {}", master),
                    Err(NetworkError::DuplicateLink(_)) => {
                        tracing::debug!("already linked to repair master {}", master)
                    }
                    Err(e) => tracing::warn!("failed to reach repair master {}: {}", master, e),
                }
            }
        }

        self.finish_repair(is_master);
    }

    fn finish_repair(&self, is_master: bool) {
        let mut repair = self.repair.lock();
        let Some(state) = repair.take() else {
            return;
        };

        for (frame, exclude) in &state.buffered {
            self.pool.multicast(frame, |peer| Some(*peer) != *exclude);
        }

        if is_master {
            let lost = Envelope::new(self.self_id, Packet::LostPeer);
            match encode_envelope(&lost) {
                Ok(frame) => {
                    let _ = self.events.send(InboundEvent::Loopback(lost));
                    self.pool.broadcast(&frame);
                }
                Err(e) => tracing::warn!("failed to encode LostPeer: {}", e),
            }
        }

        tracing::info!(
            "repair of {} finished, flushed {} held-back frames",
            state.dead,
            state.buffered.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::beacon::BeaconHub;
    use crate::network::codec::{decode_envelope, CodecError};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn localhost(port: u16) -> PeerId {
        PeerId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn overlay(base: u16) -> (Arc<Overlay>, mpsc::UnboundedReceiver<InboundEvent>) {
        let config = NetworkConfig::new()
            .listen_base_port(base)
            .max_frame_len(1024)
            .repair_timings(Duration::from_millis(50), Duration::from_millis(100));
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(LinkPool::listen(config.clone(), tx.clone()).await.unwrap());
        let shutdown = ShutdownController::new();
        let hub = BeaconHub::new();
        let discovery = Discovery::start(
            "notes",
            hub.endpoint(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            pool.clone(),
            config.clone(),
            shutdown.clone(),
            tx.clone(),
        );
        let self_id = localhost(pool.listen_port());
        (Overlay::new(self_id, pool, discovery, config, shutdown, tx), rx)
    }

    #[tokio::test]
    async fn test_peer_died_for_stranger_is_ignored() {
        let (overlay, _rx) = overlay(25900).await;
        overlay.on_peer_died(localhost(1), localhost(2));
        assert!(!overlay.in_repair());
    }

    #[tokio::test]
    async fn test_stale_link_failure_is_ignored() {
        let (overlay, _rx) = overlay(26000).await;
        overlay.link_failed(localhost(1), 42);
        assert!(!overlay.in_repair());
    }

    #[tokio::test]
    async fn test_flood_is_held_back_during_repair() {
        let (a, _rx_a) = overlay(26100).await;
        let (b, mut rx_b) = overlay(26200).await;

        let acceptor = b.pool.clone();
        let accepted =
            tokio::spawn(async move { acceptor.accept_pending(Duration::from_secs(2)).await });
        a.pool.connect_to(b.self_id()).await.unwrap();
        assert!(accepted.await.unwrap());

        *a.repair.lock() = Some(RepairState::new(localhost(1), [a.self_id()]));
        a.send(Packet::AddText { offset: 0, text: "x".into() }).unwrap();
        a.send(Packet::NewPeer).unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx_b.recv()).await.is_err());

        a.finish_repair(false);
        assert!(!a.in_repair());

        let mut kinds = Vec::new();
        for _ in 0..2 {
            match rx_b.recv().await.unwrap() {
                InboundEvent::Frame { frame, .. } => {
                    kinds.push(decode_envelope(&frame).unwrap().packet);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            kinds,
            vec![Packet::AddText { offset: 0, text: "x".into() }, Packet::NewPeer]
        );
    }

    #[tokio::test]
    async fn test_master_reports_lost_peer() {
        let (a, mut rx_a) = overlay(26300).await;
        *a.repair.lock() = Some(RepairState::new(localhost(1), [a.self_id()]));
        a.finish_repair(true);

        match rx_a.recv().await.unwrap() {
            InboundEvent::Loopback(envelope) => {
                assert_eq!(envelope.origin, a.self_id());
                assert_eq!(envelope.packet, Packet::LostPeer);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_second_repair_is_refused() {
        let (a, _rx) = overlay(26350).await;
        *a.repair.lock() = Some(RepairState::new(localhost(1), [a.self_id()]));

        a.on_peer_died(localhost(1), localhost(5));
        a.on_peer_died(localhost(2), localhost(6));

        {
            let repair = a.repair.lock();
            let state = repair.as_ref().unwrap();
            assert_eq!(state.dead, localhost(1));
            assert!(state.candidates.contains(&localhost(5)));
            assert!(!state.candidates.contains(&localhost(6)));
        }
        assert!(logs_contain("concurrent repairs are not supported"));
    }

    #[tokio::test]
    async fn test_oversized_packet_is_refused() {
        let (a, _rx) = overlay(26370).await;
        let small = Packet::AddText { offset: 0, text: "x".into() };
        assert!(a.send(small).is_ok());

        let limit = a.config.max_frame_len as usize;
        let big = Packet::Document { text: "x".repeat(limit + 1) };
        assert!(matches!(
            a.send_to(&localhost(1), big),
            Err(NetworkError::Codec(CodecError::TooLarge { .. }))
        ));
    }

    #[test]
    fn test_master_is_smallest_candidate() {
        let state = RepairState::new(localhost(9), [localhost(2000), localhost(1500), localhost(1800)]);
        assert_eq!(state.candidates.first(), Some(&localhost(1500)));
    }
}
