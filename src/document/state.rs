//! Document State
//!
//! The replicated text, remote carets and peer count, plus the packet
//! handler that applies what other peers send.

use crate::document::buffer::TextBuffer;
use crate::document::DocumentEvent;
use crate::network::{Packet, PacketHandler, PacketKind, PeerId, Reply};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Packet kinds the document handles.
pub const HANDLED_KINDS: [PacketKind; 9] = [
    PacketKind::AddText,
    PacketKind::DeleteText,
    PacketKind::Document,
    PacketKind::QueryDocument,
    PacketKind::UpdateCaret,
    PacketKind::NewPeer,
    PacketKind::LostPeer,
    PacketKind::QueryPeerCount,
    PacketKind::PeerCount,
];

#[derive(Debug)]
pub(crate) struct DocumentState {
    pub(crate) text: TextBuffer,
    pub(crate) carets: HashMap<PeerId, Option<usize>>,
    pub(crate) peer_count: usize,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self {
            text: TextBuffer::new(),
            carets: HashMap::new(),
            peer_count: 1,
        }
    }
}

/// Shared between the document handle and the session's dispatch loop.
pub(crate) struct DocumentCore {
    pub(crate) state: Mutex<DocumentState>,
    events: broadcast::Sender<DocumentEvent>,
}

impl DocumentCore {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(DocumentState::default()),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub(crate) fn emit(&self, event: DocumentEvent) {
        let _ = self.events.send(event);
    }

    /// Start over with an empty document.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        *state = DocumentState::default();
        self.emit(DocumentEvent::TextChanged(String::new()));
    }

    fn set_peer_count(&self, state: &mut DocumentState, count: usize) {
        state.peer_count = count;
        tracing::debug!("peer count is now {}", count);
        self.emit(DocumentEvent::PeerCountChanged(count));
    }
}

impl PacketHandler for DocumentCore {
    fn handle(&self, origin: PeerId, packet: Packet, reply: &Reply) {
        let mut state = self.state.lock();
        match packet {
            Packet::AddText { offset, text } => match state.text.insert(offset, &text) {
                Ok(()) => self.emit(DocumentEvent::TextChanged(state.text.to_string())),
                Err(e) => tracing::warn!("dropping AddText from {}: {}", origin, e),
            },
            Packet::DeleteText { offset, length } => match state.text.delete(offset, length) {
                Ok(()) => self.emit(DocumentEvent::TextChanged(state.text.to_string())),
                Err(e) => tracing::warn!("dropping DeleteText from {}: {}", origin, e),
            },
            Packet::Document { text } => {
                state.text.set(text);
                self.emit(DocumentEvent::TextChanged(state.text.to_string()));
            }
            Packet::QueryDocument => {
                reply.send(Packet::Document {
                    text: state.text.to_string(),
                });
            }
            Packet::UpdateCaret { position } => {
                state.carets.insert(origin, position);
                self.emit(DocumentEvent::CaretChanged {
                    peer: origin,
                    position,
                });
            }
            Packet::NewPeer => {
                let count = state.peer_count + 1;
                self.set_peer_count(&mut state, count);
            }
            Packet::LostPeer => {
                let count = state.peer_count.saturating_sub(1);
                self.set_peer_count(&mut state, count);
            }
            Packet::QueryPeerCount => {
                reply.send(Packet::PeerCount {
                    count: state.peer_count,
                });
            }
            Packet::PeerCount { count } => self.set_peer_count(&mut state, count),
            Packet::Find { .. } | Packet::PeerDied { .. } => {
                tracing::warn!("{} is not a document packet", packet.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(port: u16) -> PeerId {
        PeerId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn drain(rx: &mut broadcast::Receiver<DocumentEvent>) -> Vec<DocumentEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_remote_edits_fire_text_changed() {
        let core = DocumentCore::new(16);
        let mut rx = core.subscribe();

        core.handle(peer(1), Packet::AddText { offset: 0, text: "foo".into() }, &Reply::Discard);
        core.handle(peer(1), Packet::DeleteText { offset: 0, length: 1 }, &Reply::Discard);

        assert_eq!(core.state.lock().text.as_str(), "oo");
        assert_eq!(
            drain(&mut rx),
            vec![
                DocumentEvent::TextChanged("foo".into()),
                DocumentEvent::TextChanged("oo".into()),
            ]
        );
    }

    #[test]
    fn test_out_of_range_remote_edit_is_dropped() {
        let core = DocumentCore::new(16);
        let mut rx = core.subscribe();

        core.handle(peer(1), Packet::AddText { offset: 5, text: "x".into() }, &Reply::Discard);
        core.handle(peer(1), Packet::DeleteText { offset: 0, length: 1 }, &Reply::Discard);

        assert_eq!(core.state.lock().text.as_str(), "");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_document_twice_is_idempotent() {
        let core = DocumentCore::new(16);
        core.handle(peer(1), Packet::Document { text: "shared".into() }, &Reply::Discard);
        core.handle(peer(1), Packet::Document { text: "shared".into() }, &Reply::Discard);
        assert_eq!(core.state.lock().text.as_str(), "shared");
    }

    #[test]
    fn test_peer_count_transitions() {
        let core = DocumentCore::new(16);
        let mut rx = core.subscribe();
        assert_eq!(core.state.lock().peer_count, 1);

        core.handle(peer(1), Packet::NewPeer, &Reply::Discard);
        core.handle(peer(2), Packet::NewPeer, &Reply::Discard);
        core.handle(peer(1), Packet::LostPeer, &Reply::Discard);
        core.handle(peer(1), Packet::PeerCount { count: 5 }, &Reply::Discard);

        assert_eq!(core.state.lock().peer_count, 5);
        assert_eq!(
            drain(&mut rx),
            vec![
                DocumentEvent::PeerCountChanged(2),
                DocumentEvent::PeerCountChanged(3),
                DocumentEvent::PeerCountChanged(2),
                DocumentEvent::PeerCountChanged(5),
            ]
        );
    }

    #[test]
    fn test_carets_are_tracked_per_origin() {
        let core = DocumentCore::new(16);
        let mut rx = core.subscribe();

        core.handle(peer(1), Packet::UpdateCaret { position: Some(3) }, &Reply::Discard);
        core.handle(peer(2), Packet::UpdateCaret { position: None }, &Reply::Discard);

        let carets = core.state.lock().carets.clone();
        assert_eq!(carets.get(&peer(1)), Some(&Some(3)));
        assert_eq!(carets.get(&peer(2)), Some(&None));
        assert_eq!(
            drain(&mut rx),
            vec![
                DocumentEvent::CaretChanged { peer: peer(1), position: Some(3) },
                DocumentEvent::CaretChanged { peer: peer(2), position: None },
            ]
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let core = DocumentCore::new(16);
        core.handle(peer(1), Packet::Document { text: "old".into() }, &Reply::Discard);
        core.handle(peer(1), Packet::NewPeer, &Reply::Discard);

        let mut rx = core.subscribe();
        core.reset();

        let state = core.state.lock();
        assert!(state.text.is_empty());
        assert_eq!(state.peer_count, 1);
        assert_eq!(drain(&mut rx), vec![DocumentEvent::TextChanged(String::new())]);
    }
}
