//! Packet Router
//!
//! Decodes frames arriving on links, floods the kinds that must travel the
//! whole tree, and hands each packet to the handler registered for its kind.

use crate::network::codec::decode_envelope;
use crate::network::packet::{Envelope, Packet, PacketKind};
use crate::network::peer::PeerId;
use crate::network::topology::Overlay;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a handler's answer goes.
pub enum Reply {
    /// Back over the link the packet arrived on
    Link { overlay: Arc<Overlay>, peer: PeerId },
    /// Nowhere; the packet was generated locally
    Discard,
}

impl Reply {
    pub fn link(overlay: Arc<Overlay>, peer: PeerId) -> Self {
        Reply::Link { overlay, peer }
    }

    /// Unicast `packet` back to the sender.
    pub fn send(&self, packet: Packet) {
        match self {
            Reply::Link { overlay, peer } => {
                if let Err(e) = overlay.send_to(peer, packet) {
                    tracing::warn!("reply to {} failed: {}", peer, e);
                }
            }
            Reply::Discard => {
                tracing::debug!("discarding reply {} to local packet", packet.kind());
            }
        }
    }
}

/// Receives packets of the kinds it is registered for.
pub trait PacketHandler: Send + Sync {
    /// Handle one packet originated by `origin`.
    fn handle(&self, origin: PeerId, packet: Packet, reply: &Reply);
}

/// Routes inbound frames to packet handlers.
pub struct PacketRouter {
    overlay: Arc<Overlay>,
    handlers: RwLock<HashMap<PacketKind, Arc<dyn PacketHandler>>>,
}

impl PacketRouter {
    pub fn new(overlay: Arc<Overlay>) -> Self {
        Self {
            overlay,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&self, kind: PacketKind, handler: Arc<dyn PacketHandler>) {
        if self.handlers.write().insert(kind, handler).is_some() {
            tracing::warn!("replaced handler for {}", kind);
        }
    }

    /// Register `handler` for several kinds.
    pub fn register_all(&self, kinds: &[PacketKind], handler: Arc<dyn PacketHandler>) {
        for kind in kinds {
            self.register(*kind, handler.clone());
        }
    }

    pub fn is_registered(&self, kind: PacketKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Route a raw frame that arrived on the link to `from`.
    pub fn route(&self, frame: Bytes, from: PeerId) {
        let envelope = match decode_envelope(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping undecodable frame from {}: {}", from, e);
                return;
            }
        };
        tracing::debug!(
            "{} from {} via {}",
            envelope.packet.kind(),
            envelope.origin,
            from
        );

        if envelope.packet.is_flood() {
            self.overlay.forward(frame, Some(from));
        }

        let reply = Reply::link(self.overlay.clone(), from);
        self.dispatch(envelope, &reply);
    }

    /// Deliver a packet we generated ourselves. Replies go nowhere.
    pub fn deliver_local(&self, envelope: Envelope) {
        self.dispatch(envelope, &Reply::Discard);
    }

    fn dispatch(&self, envelope: Envelope, reply: &Reply) {
        let kind = envelope.packet.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        match handler {
            Some(handler) => handler.handle(envelope.origin, envelope.packet, reply),
            None => tracing::warn!("no handler for {}, dropped", kind),
        }
    }
}
