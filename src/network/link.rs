//! Links
//!
//! A link is one established TCP connection to exactly one peer. It runs two
//! tasks: a receive loop that hands raw frames to the node's inbound channel,
//! and a writer loop draining an ordered outbound queue. Any I/O error on
//! either side reports the link as failed exactly once and tears it down.

use crate::network::codec;
use crate::network::error::NetworkError;
use crate::network::packet::Envelope;
use crate::network::peer::PeerId;
use crate::network::shutdown::ShutdownController;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Everything that arrives at the node's single dispatch loop.
#[derive(Debug)]
pub enum InboundEvent {
    /// A raw frame read from a link
    Frame { peer: PeerId, link_id: u64, frame: Bytes },
    /// A link hit an I/O error
    Failed { peer: PeerId, link_id: u64 },
    /// A packet the node delivers to its own handlers
    Loopback(Envelope),
    /// A neighbour of `dead` announced it is repairing the tree
    PeerDied { dead: PeerId, repair: PeerId },
}

/// State shared between a link and its two tasks.
#[derive(Clone)]
struct LinkContext {
    id: u64,
    peer: PeerId,
    closed: Arc<AtomicBool>,
    stop: ShutdownController,
    events: mpsc::UnboundedSender<InboundEvent>,
}

impl LinkContext {
    /// Report failure once; an explicitly stopped link reports nothing.
    fn fail(&self, error: &std::io::Error) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("link to {} failed: {}", self.peer, error);
            let _ = self.events.send(InboundEvent::Failed {
                peer: self.peer,
                link_id: self.id,
            });
        }
        self.stop.shutdown();
    }
}

/// An established connection to one peer.
pub struct Link {
    id: u64,
    peer: PeerId,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
    stop: ShutdownController,
}

impl Link {
    /// Take over a handshaken stream and start its receive and writer loops.
    pub(crate) fn start(
        id: u64,
        peer: PeerId,
        stream: TcpStream,
        events: mpsc::UnboundedSender<InboundEvent>,
        max_frame_len: u32,
    ) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();

        let ctx = LinkContext {
            id,
            peer,
            closed: Arc::new(AtomicBool::new(false)),
            stop: ShutdownController::new(),
            events,
        };

        ctx.stop.spawn(receive_loop(reader, ctx.clone(), max_frame_len));
        ctx.stop.spawn(send_loop(writer, queue, ctx.clone()));

        Arc::new(Self {
            id,
            peer,
            outbound,
            closed: ctx.closed,
            stop: ctx.stop,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Queue a frame. Frames go out in the order they were queued.
    pub fn send(&self, frame: Bytes) -> Result<(), NetworkError> {
        if !self.is_alive() {
            return Err(NetworkError::LinkClosed(self.peer));
        }
        self.outbound
            .send(frame)
            .map_err(|_| NetworkError::LinkClosed(self.peer))
    }

    /// Tear the link down without reporting a failure.
    pub fn stop(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("closing link to {}", self.peer);
        }
        self.stop.shutdown();
    }

    /// Stop the link and wait for both of its tasks to return.
    pub async fn close(&self) {
        self.stop();
        self.stop.join_all(Duration::from_secs(1)).await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn receive_loop(mut reader: OwnedReadHalf, ctx: LinkContext, max_frame_len: u32) {
    loop {
        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            result = codec::read_frame(&mut reader, max_frame_len) => match result {
                Ok(frame) => {
                    let event = InboundEvent::Frame { peer: ctx.peer, link_id: ctx.id, frame };
                    if ctx.events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    ctx.fail(&e);
                    break;
                }
            }
        }
    }
}

async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    ctx: LinkContext,
) {
    loop {
        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            next = queue.recv() => match next {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        ctx.fail(&e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = writer.shutdown().await;
}
