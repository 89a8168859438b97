//! Packet Types
//!
//! The closed set of packets exchanged between peers. `Find` and `PeerDied`
//! only travel as UDP announcements; everything else travels over links
//! wrapped in an [`Envelope`] that names the originating peer.

use crate::network::peer::PeerId;

/// Kind tag of a packet. The numeric value is the tag written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketKind {
    Find = 1,
    PeerDied = 2,
    AddText = 3,
    DeleteText = 4,
    Document = 5,
    QueryDocument = 6,
    UpdateCaret = 7,
    NewPeer = 8,
    LostPeer = 9,
    QueryPeerCount = 10,
    PeerCount = 11,
}

impl PacketKind {
    pub const ALL: [PacketKind; 11] = [
        PacketKind::Find,
        PacketKind::PeerDied,
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

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.tag() == tag)
    }

    /// Whether every node relays this kind along the tree.
    pub fn is_flood(self) -> bool {
        matches!(
            self,
            PacketKind::AddText
                | PacketKind::DeleteText
                | PacketKind::UpdateCaret
                | PacketKind::NewPeer
                | PacketKind::LostPeer
        )
    }

    /// Whether this kind belongs on the UDP discovery channel.
    pub fn is_announcement(self) -> bool {
        matches!(self, PacketKind::Find | PacketKind::PeerDied)
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Find => "Find",
            PacketKind::PeerDied => "PeerDied",
            PacketKind::AddText => "AddText",
            PacketKind::DeleteText => "DeleteText",
            PacketKind::Document => "Document",
            PacketKind::QueryDocument => "QueryDocument",
            PacketKind::UpdateCaret => "UpdateCaret",
            PacketKind::NewPeer => "NewPeer",
            PacketKind::LostPeer => "LostPeer",
            PacketKind::QueryPeerCount => "QueryPeerCount",
            PacketKind::PeerCount => "PeerCount",
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A packet. Offsets and lengths count characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Looking for peers of a document; carries the sender's listen port.
    Find { listen_port: u16 },
    /// `dead` stopped answering; `repair` volunteers as repair master.
    PeerDied { dead: PeerId, repair: PeerId },
    AddText { offset: usize, text: String },
    DeleteText { offset: usize, length: usize },
    /// Full document snapshot, answer to `QueryDocument`.
    Document { text: String },
    QueryDocument,
    /// `None` clears the sender's caret.
    UpdateCaret { position: Option<usize> },
    NewPeer,
    LostPeer,
    QueryPeerCount,
    /// Answer to `QueryPeerCount`.
    PeerCount { count: usize },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Find { .. } => PacketKind::Find,
            Packet::PeerDied { .. } => PacketKind::PeerDied,
            Packet::AddText { .. } => PacketKind::AddText,
            Packet::DeleteText { .. } => PacketKind::DeleteText,
            Packet::Document { .. } => PacketKind::Document,
            Packet::QueryDocument => PacketKind::QueryDocument,
            Packet::UpdateCaret { .. } => PacketKind::UpdateCaret,
            Packet::NewPeer => PacketKind::NewPeer,
            Packet::LostPeer => PacketKind::LostPeer,
            Packet::QueryPeerCount => PacketKind::QueryPeerCount,
            Packet::PeerCount { .. } => PacketKind::PeerCount,
        }
    }

    pub fn is_flood(&self) -> bool {
        self.kind().is_flood()
    }
}

/// A packet on a link, stamped with the peer that originated it.
///
/// Relaying nodes forward the envelope untouched, so `origin` survives
/// any number of hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub origin: PeerId,
    pub packet: Packet,
}

impl Envelope {
    pub fn new(origin: PeerId, packet: Packet) -> Self {
        Self { origin, packet }
    }
}

/// A packet on the discovery channel, scoped to one document name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub document: String,
    pub packet: Packet,
}

impl Announcement {
    pub fn find(document: impl Into<String>, listen_port: u16) -> Self {
        Self {
            document: document.into(),
            packet: Packet::Find { listen_port },
        }
    }

    pub fn peer_died(document: impl Into<String>, dead: PeerId, repair: PeerId) -> Self {
        Self {
            document: document.into(),
            packet: Packet::PeerDied { dead, repair },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique_and_reversible() {
        for kind in PacketKind::ALL {
            assert_eq!(PacketKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PacketKind::from_tag(0), None);
        assert_eq!(PacketKind::from_tag(12), None);
    }

    #[test]
    fn test_flood_kinds() {
        let flood: Vec<_> = PacketKind::ALL.into_iter().filter(|k| k.is_flood()).collect();
        assert_eq!(
            flood,
            vec![
                PacketKind::AddText,
                PacketKind::DeleteText,
                PacketKind::UpdateCaret,
                PacketKind::NewPeer,
                PacketKind::LostPeer,
            ]
        );
    }

    #[test]
    fn test_replies_do_not_flood() {
        assert!(!Packet::Document { text: "x".into() }.is_flood());
        assert!(!Packet::PeerCount { count: 3 }.is_flood());
        assert!(!Packet::QueryDocument.is_flood());
        assert!(!Packet::QueryPeerCount.is_flood());
    }

    #[test]
    fn test_announcement_kinds() {
        assert!(Announcement::find("doc", 1338).packet.kind().is_announcement());
        assert!(!PacketKind::AddText.is_announcement());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(PacketKind::QueryPeerCount.to_string(), "QueryPeerCount");
        assert_eq!(Packet::UpdateCaret { position: None }.kind().to_string(), "UpdateCaret");
    }
}
