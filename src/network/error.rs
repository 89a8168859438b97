//! Network Errors

use crate::network::codec::CodecError;
use crate::network::config::ConfigError;
use crate::network::peer::PeerId;

/// Errors raised by the peer network.
///
/// Finding no peer during discovery is not an error: it is the
/// first-owner outcome and is reported as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("already linked to {0}")]
    DuplicateLink(PeerId),

    #[error("link to {0} is closed")]
    LinkClosed(PeerId),

    #[error("no free TCP listen port at or above {0}")]
    NoListenPort(u16),

    #[error("own address not observed within {0:?}")]
    OwnAddressUnresolved(std::time::Duration),

    #[error("network is not connected")]
    NotConnected,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub(crate) fn handshake(peer: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        NetworkError::Handshake {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}
