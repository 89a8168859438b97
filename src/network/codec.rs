//! Frame Codec
//!
//! Every packet travels in an explicit, versioned frame:
//!
//! ```text
//! +---------+--------+----------------+------------------------------+
//! | version | kind   | length (u32BE) | payload (bincode, `length`)  |
//! | 1 byte  | 1 byte | 4 bytes        | (scope, field, field, ...)   |
//! +---------+--------+----------------+------------------------------+
//! ```
//!
//! The scope is the origin [`PeerId`] for link frames and the document name
//! for discovery datagrams. Encoding and decoding are pure functions; only
//! [`read_frame`] touches I/O.

use crate::network::packet::{Announcement, Envelope, Packet, PacketKind};
use crate::network::peer::PeerId;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Version written into every frame.
pub const FRAME_VERSION: u8 = 1;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 6;

/// Frame encoding and decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet kind tag {0}")]
    UnknownKind(u8),
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame payload of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: usize, limit: u32 },
    #[error("{0} is not valid in this channel")]
    WrongChannel(PacketKind),
    #[error("value {0} does not fit in usize")]
    Overflow(u64),
    #[error("payload encoding: {0}")]
    Payload(#[from] bincode::Error),
}

/// Parsed fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub kind_tag: u8,
    pub length: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated(buf.len()));
        }
        Ok(Self {
            version: buf[0],
            kind_tag: buf[1],
            length: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }

    /// Resolve the kind, rejecting unknown versions and tags.
    pub fn kind(&self) -> Result<PacketKind, CodecError> {
        if self.version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(self.version));
        }
        PacketKind::from_tag(self.kind_tag).ok_or(CodecError::UnknownKind(self.kind_tag))
    }
}

/// Encode a link frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let kind = envelope.packet.kind();
    if kind.is_announcement() {
        return Err(CodecError::WrongChannel(kind));
    }
    encode_frame(&envelope.origin, &envelope.packet)
}

/// Decode a link frame.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, CodecError> {
    let (origin, packet) = decode_frame::<PeerId>(frame)?;
    if packet.kind().is_announcement() {
        return Err(CodecError::WrongChannel(packet.kind()));
    }
    Ok(Envelope { origin, packet })
}

/// Encode a discovery datagram.
pub fn encode_announcement(announcement: &Announcement) -> Result<Bytes, CodecError> {
    let kind = announcement.packet.kind();
    if !kind.is_announcement() {
        return Err(CodecError::WrongChannel(kind));
    }
    encode_frame(&announcement.document, &announcement.packet)
}

/// Decode a discovery datagram.
pub fn decode_announcement(frame: &[u8]) -> Result<Announcement, CodecError> {
    let (document, packet) = decode_frame::<String>(frame)?;
    if !packet.kind().is_announcement() {
        return Err(CodecError::WrongChannel(packet.kind()));
    }
    Ok(Announcement { document, packet })
}

fn encode_frame<S: Serialize>(scope: &S, packet: &Packet) -> Result<Bytes, CodecError> {
    let payload = match packet {
        Packet::Find { listen_port } => bincode::serialize(&(scope, listen_port))?,
        Packet::PeerDied { dead, repair } => bincode::serialize(&(scope, dead, repair))?,
        Packet::AddText { offset, text } => bincode::serialize(&(scope, *offset as u64, text))?,
        Packet::DeleteText { offset, length } => {
            bincode::serialize(&(scope, *offset as u64, *length as u64))?
        }
        Packet::Document { text } => bincode::serialize(&(scope, text))?,
        Packet::UpdateCaret { position } => {
            bincode::serialize(&(scope, position.map(|p| p as u64)))?
        }
        Packet::PeerCount { count } => bincode::serialize(&(scope, *count as u64))?,
        Packet::QueryDocument | Packet::NewPeer | Packet::LostPeer | Packet::QueryPeerCount => {
            bincode::serialize(&(scope,))?
        }
    };

    let length = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge {
        len: payload.len(),
        limit: u32::MAX,
    })?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(FRAME_VERSION);
    frame.put_u8(packet.kind().tag());
    frame.put_u32(length);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Refuse an encoded frame whose payload a peer limited to `limit` bytes
/// would reject.
pub fn check_frame_len(frame: &[u8], limit: u32) -> Result<(), CodecError> {
    let len = frame.len().saturating_sub(HEADER_LEN);
    if len > limit as usize {
        return Err(CodecError::TooLarge { len, limit });
    }
    Ok(())
}

fn to_usize(value: u64) -> Result<usize, CodecError> {
    usize::try_from(value).map_err(|_| CodecError::Overflow(value))
}

fn decode_frame<S: DeserializeOwned>(frame: &[u8]) -> Result<(S, Packet), CodecError> {
    let header = FrameHeader::parse(frame)?;
    let kind = header.kind()?;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != header.length as usize {
        return Err(CodecError::LengthMismatch {
            declared: header.length as usize,
            actual: payload.len(),
        });
    }

    let decoded = match kind {
        PacketKind::Find => {
            let (scope, listen_port): (S, u16) = bincode::deserialize(payload)?;
            (scope, Packet::Find { listen_port })
        }
        PacketKind::PeerDied => {
            let (scope, dead, repair): (S, PeerId, PeerId) = bincode::deserialize(payload)?;
            (scope, Packet::PeerDied { dead, repair })
        }
        PacketKind::AddText => {
            let (scope, offset, text): (S, u64, String) = bincode::deserialize(payload)?;
            (scope, Packet::AddText { offset: to_usize(offset)?, text })
        }
        PacketKind::DeleteText => {
            let (scope, offset, length): (S, u64, u64) = bincode::deserialize(payload)?;
            (
                scope,
                Packet::DeleteText {
                    offset: to_usize(offset)?,
                    length: to_usize(length)?,
                },
            )
        }
        PacketKind::Document => {
            let (scope, text): (S, String) = bincode::deserialize(payload)?;
            (scope, Packet::Document { text })
        }
        PacketKind::UpdateCaret => {
            let (scope, position): (S, Option<u64>) = bincode::deserialize(payload)?;
            let position = position.map(to_usize).transpose()?;
            (scope, Packet::UpdateCaret { position })
        }
        PacketKind::PeerCount => {
            let (scope, count): (S, u64) = bincode::deserialize(payload)?;
            (scope, Packet::PeerCount { count: to_usize(count)? })
        }
        PacketKind::QueryDocument => (bincode::deserialize::<(S,)>(payload)?.0, Packet::QueryDocument),
        PacketKind::NewPeer => (bincode::deserialize::<(S,)>(payload)?.0, Packet::NewPeer),
        PacketKind::LostPeer => (bincode::deserialize::<(S,)>(payload)?.0, Packet::LostPeer),
        PacketKind::QueryPeerCount => {
            (bincode::deserialize::<(S,)>(payload)?.0, Packet::QueryPeerCount)
        }
    };
    Ok(decoded)
}

/// Read one raw frame (header and payload) from a stream.
///
/// Only the length is checked here, so a frame of an unknown kind or version
/// is still consumed whole and the stream stays aligned.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            CodecError::TooLarge {
                len: len as usize,
                limit: max_len,
            },
        ));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + len as usize);
    frame.put_slice(&header);
    frame.resize(HEADER_LEN + len as usize, 0);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> PeerId {
        PeerId::new("192.168.1.20".parse().unwrap(), 1338)
    }

    fn link_packets() -> Vec<Packet> {
        vec![
            Packet::AddText { offset: 7, text: "héllo\nwörld".into() },
            Packet::DeleteText { offset: 3, length: 12 },
            Packet::Document { text: String::new() },
            Packet::Document { text: "full text".into() },
            Packet::QueryDocument,
            Packet::UpdateCaret { position: Some(42) },
            Packet::UpdateCaret { position: None },
            Packet::NewPeer,
            Packet::LostPeer,
            Packet::QueryPeerCount,
            Packet::PeerCount { count: 5 },
        ]
    }

    #[test]
    fn test_envelope_round_trip_every_kind() {
        for packet in link_packets() {
            let envelope = Envelope::new(origin(), packet);
            let frame = encode_envelope(&envelope).unwrap();
            assert_eq!(decode_envelope(&frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_announcement_round_trip_every_kind() {
        let find = Announcement::find("notes.txt", 1340);
        let died = Announcement::peer_died(
            "notes.txt",
            PeerId::new("10.0.0.2".parse().unwrap(), 1339),
            PeerId::new("::1".parse().unwrap(), 1338),
        );
        for announcement in [find, died] {
            let frame = encode_announcement(&announcement).unwrap();
            assert_eq!(decode_announcement(&frame).unwrap(), announcement);
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_envelope(&Envelope::new(origin(), Packet::NewPeer)).unwrap();
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.version, FRAME_VERSION);
        assert_eq!(header.kind_tag, PacketKind::NewPeer.tag());
        assert_eq!(header.length as usize, frame.len() - HEADER_LEN);
    }

    #[test]
    fn test_wrong_channel_rejected() {
        let err = encode_envelope(&Envelope::new(origin(), Packet::Find { listen_port: 1 }));
        assert!(matches!(err, Err(CodecError::WrongChannel(PacketKind::Find))));

        let err = encode_announcement(&Announcement {
            document: "doc".into(),
            packet: Packet::NewPeer,
        });
        assert!(matches!(err, Err(CodecError::WrongChannel(PacketKind::NewPeer))));
    }

    #[test]
    fn test_unknown_version_and_kind() {
        let frame = encode_envelope(&Envelope::new(origin(), Packet::LostPeer)).unwrap();

        let mut bad_version = frame.to_vec();
        bad_version[0] = 9;
        assert!(matches!(
            decode_envelope(&bad_version),
            Err(CodecError::UnsupportedVersion(9))
        ));

        let mut bad_kind = frame.to_vec();
        bad_kind[1] = 200;
        assert!(matches!(decode_envelope(&bad_kind), Err(CodecError::UnknownKind(200))));
    }

    #[test]
    fn test_truncated_and_mismatched_frames() {
        assert!(matches!(decode_envelope(&[1, 2]), Err(CodecError::Truncated(2))));

        let frame = encode_envelope(&Envelope::new(origin(), Packet::PeerCount { count: 2 }))
            .unwrap();
        let short = &frame[..frame.len() - 1];
        assert!(matches!(
            decode_envelope(short),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let first = encode_envelope(&Envelope::new(origin(), Packet::NewPeer)).unwrap();
        let second = encode_envelope(&Envelope::new(
            origin(),
            Packet::AddText { offset: 0, text: "abc".into() },
        ))
        .unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        let mut reader = stream.as_slice();

        let a = read_frame(&mut reader, 1024).await.unwrap();
        let b = read_frame(&mut reader, 1024).await.unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(read_frame(&mut reader, 1024).await.is_err());
    }

    #[test]
    fn test_check_frame_len() {
        let frame = encode_envelope(&Envelope::new(
            origin(),
            Packet::AddText { offset: 0, text: "x".repeat(300) },
        ))
        .unwrap();
        let payload = frame.len() - HEADER_LEN;

        assert!(check_frame_len(&frame, payload as u32).is_ok());
        assert!(matches!(
            check_frame_len(&frame, 256),
            Err(CodecError::TooLarge { len, limit: 256 }) if len == payload
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let frame = encode_envelope(&Envelope::new(
            origin(),
            Packet::Document { text: "x".repeat(100) },
        ))
        .unwrap();
        let mut reader = &frame[..];
        let err = read_frame(&mut reader, 10).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
