//! Peer Network
//!
//! Serverless networking for one shared document: peers find each other,
//! arrange themselves into a tree and keep it whole when one of them goes
//! away.
//!
//! ## Architecture
//!
//! - **Discovery**: UDP broadcast rendezvous per document name (`Find`, `PeerDied`)
//! - **Links**: one TCP connection per neighbour, opened with a port handshake
//! - **Overlay**: spanning tree maintenance and the repair protocol
//! - **Router**: decodes frames, floods tree-wide kinds, dispatches to handlers
//!
//! ## How It Works
//!
//! 1. A node binds the first free TCP port at or above 1338 and broadcasts `Find`
//! 2. Every node on the same document connects back; the first accepted link wins
//! 3. Edits and carets flood along the tree, each node relaying to its other links
//! 4. When a link fails, the dead node's neighbours elect the smallest of them as
//!    master and reconnect through it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use syncedit::network::{BeaconHub, NetworkConfig};
//! use syncedit::ReplicatedDocument;
//!
//! let hub = BeaconHub::new();
//! let config = NetworkConfig::new().listen_base_port(4000);
//! let doc = ReplicatedDocument::new(config, hub.endpoint("127.0.0.1".parse()?));
//! let joined = doc.connect("notes").await?;
//! ```

mod beacon;
mod codec;
mod config;
mod discovery;
mod error;
mod link;
mod packet;
mod peer;
mod pool;
mod router;
mod shutdown;
mod topology;

pub use beacon::{is_local_address, Beacon, BeaconHub, MemoryBeacon, UdpBeacon};
pub use codec::{
    check_frame_len, decode_announcement, decode_envelope, encode_announcement, encode_envelope,
    read_frame, CodecError, FrameHeader, FRAME_VERSION, HEADER_LEN,
};
pub use config::{ConfigError, NetworkConfig};
pub use discovery::Discovery;
pub use error::NetworkError;
pub use link::{InboundEvent, Link};
pub use packet::{Announcement, Envelope, Packet, PacketKind};
pub use peer::PeerId;
pub use pool::LinkPool;
pub use router::{PacketHandler, PacketRouter, Reply};
pub use shutdown::ShutdownController;
pub use topology::Overlay;
