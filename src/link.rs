//! Long-lived peer-to-peer links.
//!
//! Once the `Connect` handshake has succeeded, a connection becomes a [`Link`] driven by three tasks:
//!
//! - a writer draining the link's outbound queue onto the socket,
//! - a reader answering pings, routing pongs to the prober and handing gossip to the owner,
//! - a liveness monitor probing the peer every probe interval.
//!
//! The owner only ever enqueues with [`Link::try_send`], so a stalled peer cannot block it. Dropping a link aborts
//! all three tasks, which drops both socket halves.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::future::{AbortHandle, Abortable};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    actor::ActorRef,
    address::Address,
    config::MembershipConfig,
    gossip::GossipMessage,
    liveness::{self, LivenessUpdate, Prober},
    message::Message,
    transport::{Connection, FrameReader, FrameWriter},
    wire::WireMessage,
};

static LINK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Pongs are consumed one probe at a time; a handful of late ones is plenty.
const PONG_BUFFER: usize = 8;

/// Identifies one link, so that updates from a replaced link can be told apart from the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub(crate) fn new(id: u64) -> Self {
        LinkId(id)
    }

    fn generate() -> Self {
        LinkId(LINK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Which side opened a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkDirection {
    /// This node dialed the peer.
    Outbound,
    /// The peer dialed this node.
    Inbound,
}

/// Probe and buffering settings for a link.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LinkSettings {
    pub(crate) probe_interval: Duration,
    pub(crate) probe_timeout: Duration,
    pub(crate) max_missed_probes: u32,
    pub(crate) buffer: usize,
}

impl From<&MembershipConfig> for LinkSettings {
    fn from(config: &MembershipConfig) -> Self {
        LinkSettings {
            probe_interval: config.probe_interval,
            probe_timeout: config.probe_timeout,
            max_missed_probes: config.max_missed_probes,
            buffer: config.link_buffer,
        }
    }
}

/// A gossip message received on a link, delivered to the link's owner.
#[derive(Clone, Debug)]
pub(crate) struct InboundGossip {
    pub(crate) message: GossipMessage,
    pub(crate) from: Address,
    pub(crate) link: LinkId,
}

/// Handle to an established link.
#[derive(Debug)]
pub(crate) struct Link {
    id: LinkId,
    peer: Address,
    direction: LinkDirection,
    outbound: mpsc::Sender<WireMessage>,
    tasks: [AbortHandle; 3],
}

impl Link {
    /// Starts the writer, reader and liveness tasks of a link over an already handshaken connection.
    ///
    /// Gossip and liveness updates are sent to `owner`.
    pub(crate) fn spawn<A>(
        conn: Connection,
        peer: Address,
        direction: LinkDirection,
        settings: LinkSettings,
        owner: ActorRef<A>,
    ) -> Self
    where
        A: Message<InboundGossip> + Message<LivenessUpdate>,
    {
        let id = LinkId::generate();
        let (reader, writer) = conn.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.buffer.max(1));
        let (pong_tx, pong_rx) = mpsc::channel(PONG_BUFFER);

        let (writer_handle, registration) = AbortHandle::new_pair();
        tokio::spawn(Abortable::new(
            write_loop(writer, outbound_rx, peer.clone(), id),
            registration,
        ));

        let (reader_handle, registration) = AbortHandle::new_pair();
        tokio::spawn(Abortable::new(
            read_loop(
                reader,
                peer.clone(),
                id,
                outbound_tx.clone(),
                pong_tx,
                owner.clone(),
                writer_handle.clone(),
            ),
            registration,
        ));

        let (monitor_handle, registration) = AbortHandle::new_pair();
        let prober = Prober::new(outbound_tx.clone(), pong_rx, settings.probe_timeout);
        tokio::spawn(Abortable::new(
            liveness::monitor(
                peer.clone(),
                id,
                prober,
                settings.probe_interval,
                settings.max_missed_probes,
                owner,
            ),
            registration,
        ));

        debug!(%peer, link = %id, ?direction, "link established");

        Link {
            id,
            peer,
            direction,
            outbound: outbound_tx,
            tasks: [writer_handle, reader_handle, monitor_handle],
        }
    }

    pub(crate) fn id(&self) -> LinkId {
        self.id
    }

    pub(crate) fn peer(&self) -> &Address {
        &self.peer
    }

    pub(crate) fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// The node that dialed this link.
    pub(crate) fn dialer<'a>(&'a self, local: &'a Address) -> &'a Address {
        match self.direction {
            LinkDirection::Outbound => local,
            LinkDirection::Inbound => &self.peer,
        }
    }

    /// Queues a message without waiting. Returns `false` if the queue is full or the link is gone.
    pub(crate) fn try_send(&self, msg: WireMessage) -> bool {
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                debug!(peer = %self.peer, link = %self.id, kind = msg.kind(), "link saturated, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stops every task of the link, closing the socket.
    fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        trace!(peer = %self.peer, link = %self.id, "link closed");
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut writer: FrameWriter,
    mut outbound: mpsc::Receiver<WireMessage>,
    peer: Address,
    link: LinkId,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(err) = writer.send(&msg).await {
            debug!(%peer, %link, error = %err, "link write failed");
            return;
        }
    }
}

async fn read_loop<A>(
    mut reader: FrameReader,
    peer: Address,
    link: LinkId,
    outbound: mpsc::Sender<WireMessage>,
    pongs: mpsc::Sender<u64>,
    owner: ActorRef<A>,
    writer: AbortHandle,
) where
    A: Message<InboundGossip>,
{
    loop {
        match reader.recv().await {
            Ok(Some(WireMessage::Ping { nonce })) => {
                if outbound.send(WireMessage::Pong { nonce }).await.is_err() {
                    break;
                }
            }
            Ok(Some(WireMessage::Pong { nonce })) => {
                let _ = pongs.try_send(nonce);
            }
            Ok(Some(WireMessage::Gossip(message))) => {
                let gossip = InboundGossip {
                    message,
                    from: peer.clone(),
                    link,
                };
                if owner.tell(gossip).await.is_err() {
                    break;
                }
            }
            Ok(Some(other)) => {
                warn!(%peer, %link, kind = other.kind(), "unexpected message on link, closing");
                break;
            }
            Ok(None) => {
                debug!(%peer, %link, "link closed by peer");
                break;
            }
            Err(err) if err.is_protocol_error() => {
                warn!(%peer, %link, error = %err, "protocol error on link, closing");
                break;
            }
            Err(err) => {
                debug!(%peer, %link, error = %err, "link read failed");
                break;
            }
        }
    }

    // Without a reader the link can no longer answer probes; drop the write half too so the peer sees EOF.
    writer.abort();
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;
    use tokio::time;

    use crate::{
        actor::{self, Actor},
        liveness::LivenessState,
        message::Context,
        transport::Endpoint,
    };

    use super::*;

    #[derive(Default, Clone)]
    struct Recorded {
        gossip: Arc<Mutex<Vec<InboundGossip>>>,
        liveness: Arc<Mutex<Vec<LivenessUpdate>>>,
    }

    struct Owner(Recorded);

    impl Actor for Owner {}

    impl Message<InboundGossip> for Owner {
        type Reply = ();

        async fn handle(&mut self, msg: InboundGossip, _ctx: Context<'_, Self>) {
            self.0.gossip.lock().unwrap().push(msg);
        }
    }

    impl Message<LivenessUpdate> for Owner {
        type Reply = ();

        async fn handle(&mut self, msg: LivenessUpdate, _ctx: Context<'_, Self>) {
            self.0.liveness.lock().unwrap().push(msg);
        }
    }

    fn settings() -> LinkSettings {
        LinkSettings {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            max_missed_probes: 2,
            buffer: 16,
        }
    }

    async fn connected_pair() -> (Connection, Connection) {
        let endpoint = Endpoint::default();
        let mut incoming = endpoint.listen(&Address::new("127.0.0.1", 0)).await.unwrap();
        let dialed = endpoint.dial(incoming.local_address()).await.unwrap();
        let accepted = incoming.next().await.unwrap().unwrap();
        (dialed, accepted)
    }

    #[tokio::test]
    async fn two_ends_probe_each_other_and_exchange_gossip() {
        let (dialed, accepted) = connected_pair().await;
        let a = Address::new("127.0.0.1", 1);
        let b = Address::new("127.0.0.1", 2);

        let recorded_a = Recorded::default();
        let recorded_b = Recorded::default();
        let owner_a = actor::spawn(Owner(recorded_a.clone()));
        let owner_b = actor::spawn(Owner(recorded_b.clone()));

        let link_a = Link::spawn(dialed, b.clone(), LinkDirection::Outbound, settings(), owner_a);
        let link_b = Link::spawn(accepted, a.clone(), LinkDirection::Inbound, settings(), owner_b);
        assert_eq!(link_a.dialer(&a), &a);
        assert_eq!(link_b.dialer(&b), &a);

        let message = GossipMessage {
            origin: a.clone(),
            sequence: 1,
            payload: "hello".into(),
        };
        assert!(link_a.try_send(WireMessage::Gossip(message.clone())));

        time::sleep(Duration::from_millis(300)).await;

        let received = recorded_b.gossip.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, message);
        assert_eq!(received[0].from, a);
        assert_eq!(received[0].link, link_b.id());

        for recorded in [&recorded_a, &recorded_b] {
            let updates = recorded.liveness.lock().unwrap();
            assert!(!updates.is_empty());
            assert!(updates.iter().all(|u| u.state == LivenessState::Alive));
        }

        link_a.close();
        link_b.close();
    }

    #[tokio::test]
    async fn closed_remote_is_declared_dead() {
        let (dialed, accepted) = connected_pair().await;
        let recorded = Recorded::default();
        let owner = actor::spawn(Owner(recorded.clone()));
        let peer = Address::new("127.0.0.1", 2);

        let link = Link::spawn(dialed, peer.clone(), LinkDirection::Outbound, settings(), owner);
        drop(accepted);

        time::sleep(Duration::from_millis(400)).await;

        let updates = recorded.liveness.lock().unwrap();
        let last = updates.last().expect("liveness updates");
        assert_eq!(last.state, LivenessState::Dead);
        assert_eq!(last.peer, peer);
        assert_eq!(last.link, link.id());
        assert_eq!(
            updates.iter().filter(|u| u.state == LivenessState::Dead).count(),
            1
        );
        assert!(!link.try_send(WireMessage::Ping { nonce: 1 }));
    }
}
