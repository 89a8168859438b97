//! Replicated Document
//!
//! The shared plain-text document. Local edits are applied immediately and
//! flooded to every peer as `DeleteText`/`AddText`; remote edits are applied
//! in arrival order. There is no merging: concurrent edits to the same
//! region can leave peers with different text.

mod buffer;
mod session;
mod state;

pub use buffer::TextBuffer;

use crate::network::{Beacon, NetworkConfig, NetworkError, Overlay, Packet, PacketKind, PeerId};
use parking_lot::RwLock;
use session::Session;
use state::{DocumentCore, HANDLED_KINDS};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the event channel before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 1024;

/// Observable changes to the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// The text changed (local or remote edit, snapshot, reset)
    TextChanged(String),
    /// A peer moved (or cleared) its caret
    CaretChanged { peer: PeerId, position: Option<usize> },
    /// The number of peers editing the document changed
    PeerCountChanged(usize),
}

/// Document errors.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document is already connected")]
    AlreadyConnected,

    #[error("document is not connected")]
    NotConnected,

    #[error("range {offset}+{length} is outside a document of {len} characters")]
    OutOfRange {
        offset: usize,
        length: usize,
        len: usize,
    },

    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// A plain-text document kept in sync with every peer editing the same name.
pub struct ReplicatedDocument {
    config: NetworkConfig,
    beacon: Arc<dyn Beacon>,
    core: Arc<DocumentCore>,
    lifecycle: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

impl ReplicatedDocument {
    pub fn new(config: NetworkConfig, beacon: Arc<dyn Beacon>) -> Self {
        Self {
            config,
            beacon,
            core: Arc::new(DocumentCore::new(EVENT_CAPACITY)),
            lifecycle: tokio::sync::Mutex::new(()),
            session: RwLock::new(None),
        }
    }

    /// Receive document events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.core.subscribe()
    }

    /// Join the peers editing `document`, or start it if there are none.
    ///
    /// The local text is reset first. Returns true if an existing peer was
    /// joined, in which case the text arrives shortly after as a
    /// [`DocumentEvent::TextChanged`].
    pub async fn connect(&self, document: &str) -> Result<bool, DocumentError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.session.read().is_some() {
            return Err(DocumentError::AlreadyConnected);
        }

        self.core.reset();
        let (session, joined) = Session::start(
            document,
            self.config.clone(),
            self.beacon.clone(),
            self.core.clone(),
            &HANDLED_KINDS,
        )
        .await?;

        let overlay = session.overlay().clone();
        *self.session.write() = Some(Arc::new(session));

        if joined {
            overlay.send(Packet::QueryDocument)?;
            overlay.send(Packet::NewPeer)?;
            overlay.send(Packet::QueryPeerCount)?;
        }
        Ok(joined)
    }

    /// Leave the document. No events fire once this returns.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// Replace `length` characters at `offset` with `text`.
    ///
    /// The local text changes immediately and fires `TextChanged`. An edit
    /// peers could not receive (out of range, or a frame over
    /// `max_frame_len`) changes nothing.
    pub fn change_text(&self, offset: usize, length: usize, text: &str) -> Result<(), DocumentError> {
        let overlay = self.overlay()?;
        let delete = if length > 0 {
            Some(overlay.encode(Packet::DeleteText { offset, length })?)
        } else {
            None
        };
        let add = if text.is_empty() {
            None
        } else {
            Some(overlay.encode(Packet::AddText {
                offset,
                text: text.to_string(),
            })?)
        };

        let mut state = self.core.state.lock();
        state.text.splice(offset, length, text)?;
        if let Some(frame) = delete {
            overlay.send_encoded(PacketKind::DeleteText, frame);
        }
        if let Some(frame) = add {
            overlay.send_encoded(PacketKind::AddText, frame);
        }
        self.core.emit(DocumentEvent::TextChanged(state.text.to_string()));
        Ok(())
    }

    /// Tell peers where our caret is, or that we have none.
    pub fn change_caret_pos(&self, position: Option<usize>) -> Result<(), DocumentError> {
        self.overlay()?.send(Packet::UpdateCaret { position })?;
        Ok(())
    }

    pub fn text(&self) -> String {
        self.core.state.lock().text.to_string()
    }

    pub fn peer_count(&self) -> usize {
        self.core.state.lock().peer_count
    }

    /// Last known caret of every peer that reported one.
    pub fn carets(&self) -> HashMap<PeerId, Option<usize>> {
        self.core.state.lock().carets.clone()
    }

    /// Our identity in the current session.
    pub fn self_id(&self) -> Option<PeerId> {
        self.session.read().as_ref().map(|s| s.overlay().self_id())
    }

    /// The overlay of the current session.
    pub fn overlay(&self) -> Result<Arc<Overlay>, DocumentError> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.overlay().clone())
            .ok_or(DocumentError::NotConnected)
    }
}
