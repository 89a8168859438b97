//! Session
//!
//! Everything one `connect` brings up: the link pool, discovery, the overlay
//! and the dispatch loop that feeds the document. Closing the session tears
//! all of it down and waits for every task.

use crate::network::{
    Beacon, Discovery, InboundEvent, LinkPool, NetworkConfig, NetworkError, Overlay, PacketHandler,
    PacketKind, PacketRouter, PeerId, ShutdownController,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound on waiting for session tasks when closing.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) struct Session {
    document: String,
    shutdown: ShutdownController,
    pool: Arc<LinkPool>,
    overlay: Arc<Overlay>,
}

impl Session {
    /// Bring up the network for `document` and join or found its tree.
    ///
    /// Returns the session and whether an existing peer was joined.
    #[tracing::instrument(name = "session_start", skip_all, fields(document = %document))]
    pub(crate) async fn start(
        document: &str,
        config: NetworkConfig,
        beacon: Arc<dyn Beacon>,
        handler: Arc<dyn PacketHandler>,
        kinds: &[PacketKind],
    ) -> Result<(Self, bool), NetworkError> {
        config.validate()?;

        let (events, inbound) = mpsc::unbounded_channel();
        let shutdown = ShutdownController::new();
        let pool = Arc::new(LinkPool::listen(config.clone(), events.clone()).await?);
        let discovery = Discovery::start(
            document,
            beacon,
            pool.clone(),
            config.clone(),
            shutdown.clone(),
            events.clone(),
        );

        let (joined, self_id) = match Self::rendezvous(&discovery).await {
            Ok(found) => found,
            Err(e) => {
                shutdown.shutdown();
                pool.close().await;
                shutdown.join_all(CLOSE_TIMEOUT).await;
                return Err(e);
            }
        };

        let overlay = Overlay::new(self_id, pool.clone(), discovery, config, shutdown.clone(), events);
        let router = Arc::new(PacketRouter::new(overlay.clone()));
        router.register_all(kinds, handler);
        shutdown.spawn(dispatch(inbound, router, overlay.clone(), shutdown.clone()));

        tracing::info!("session for '{}' started as {}", document, self_id);
        Ok((
            Self {
                document: document.to_string(),
                shutdown,
                pool,
                overlay,
            },
            joined,
        ))
    }

    async fn rendezvous(discovery: &Discovery) -> Result<(bool, PeerId), NetworkError> {
        let joined = discovery.find_peer().await?;
        let self_id = discovery.resolve_self().await?;
        Ok((joined, self_id))
    }

    pub(crate) fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    /// Stop every task and close every link.
    pub(crate) async fn close(&self) {
        tracing::info!("closing session for '{}'", self.document);
        self.shutdown.shutdown();
        self.pool.close().await;
        if !self.shutdown.join_all(CLOSE_TIMEOUT).await {
            tracing::warn!("session tasks for '{}' had to be aborted", self.document);
        }
    }
}

/// The single consumer of link frames, link failures and local packets.
async fn dispatch(
    mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    router: Arc<PacketRouter>,
    overlay: Arc<Overlay>,
    shutdown: ShutdownController,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            InboundEvent::Frame { peer, frame, .. } => router.route(frame, peer),
            InboundEvent::Failed { peer, link_id } => overlay.link_failed(peer, link_id),
            InboundEvent::Loopback(envelope) => router.deliver_local(envelope),
            InboundEvent::PeerDied { dead, repair } => overlay.on_peer_died(dead, repair),
        }
    }
    tracing::debug!("dispatch loop stopped");
}
