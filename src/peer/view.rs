use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use rand::rngs::StdRng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::{
    actor::Actor,
    address::Address,
    config::MembershipConfig,
    directory::PeerDirectory,
    error::ActorStopReason,
    gossip::{GossipDisseminator, GossipMessage},
    link::{InboundGossip, Link},
    liveness::{DeadNodeReport, LivenessState, LivenessUpdate},
    message::{Context, Message},
    peer::PeerEvent,
    wire::WireMessage,
};

/// A peer's local view: what it knows, whom it is linked to, and what gossip it has seen.
///
/// Handlers never wait on the network. Frames are queued on links with [`Link::try_send`], and dead-node reports
/// are handed to the reporter task over an unbounded channel.
#[derive(Debug)]
pub(crate) struct PeerView {
    local: Address,
    max_fanout: usize,
    max_connections: usize,
    /// Every peer learned from seeds, links and gossip.
    known: PeerDirectory,
    /// Peers with an established link, with their liveness metadata.
    linked: PeerDirectory,
    links: HashMap<Address, Link>,
    /// Slots promised to handshakes still in flight, as `(peer, dialer)`.
    pending: HashSet<(Address, Address)>,
    gossip: GossipDisseminator,
    rng: StdRng,
    events: broadcast::Sender<PeerEvent>,
    reports: mpsc::UnboundedSender<DeadNodeReport>,
}

impl PeerView {
    pub(crate) fn new(
        local: Address,
        config: &MembershipConfig,
        gossip: GossipDisseminator,
        rng: StdRng,
        events: broadcast::Sender<PeerEvent>,
        reports: mpsc::UnboundedSender<DeadNodeReport>,
    ) -> Self {
        PeerView {
            local,
            max_fanout: config.max_fanout,
            max_connections: config.max_connections,
            known: PeerDirectory::new(),
            linked: PeerDirectory::new(),
            links: HashMap::new(),
            pending: HashSet::new(),
            gossip,
            rng,
            events,
            reports,
        }
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn send_to(&self, targets: &[Address], msg: &WireMessage) {
        for target in targets {
            if let Some(link) = self.links.get(target) {
                link.try_send(msg.clone());
            }
        }
    }

    /// Whether a link dialed by `dialer` should be kept over whatever link to `peer` already exists.
    ///
    /// Of two links between the same pair of nodes, the one dialed by the lower address wins on both ends. A newer
    /// link from the same dialer replaces the older one, so a peer restarted on the same address is let back in.
    fn prefers(&self, peer: &Address, dialer: &Address) -> bool {
        match self.links.get(peer) {
            Some(existing) => dialer <= existing.dialer(&self.local),
            None => true,
        }
    }

    /// Distinct peers that are linked or have a handshake in flight.
    fn slots_in_use(&self) -> usize {
        let waiting = self
            .pending
            .iter()
            .map(|(peer, _)| peer)
            .filter(|peer| !self.links.contains_key(*peer))
            .unique()
            .count();
        self.links.len() + waiting
    }

    fn has_slot_for(&self, peer: &Address) -> bool {
        self.links.contains_key(peer)
            || self.pending.iter().any(|(pending, _)| pending == peer)
            || self.slots_in_use() < self.max_connections
    }

    fn declare_dead(&mut self, peer: Address) {
        // Dropping the link aborts its tasks.
        drop(self.links.remove(&peer));
        self.linked.remove(&peer);
        self.known.remove(&peer);

        let report = DeadNodeReport::new(self.local.clone(), peer.clone());
        warn!(%peer, links = self.links.len(), "peer declared dead");
        if self.reports.send(report.clone()).is_err() {
            debug!(%peer, "reporter stopped, dead-node report dropped");
        }
        self.emit(PeerEvent::PeerDead(report));
        self.emit(PeerEvent::Disconnected(peer));
    }
}

impl Actor for PeerView {
    fn name() -> &'static str {
        "PeerView"
    }

    async fn on_stop(&mut self, _reason: ActorStopReason) {
        let links = self.links.len();
        self.links.clear();
        self.pending.clear();
        self.linked = PeerDirectory::new();
        debug!(local = %self.local, links, "closed all links");
    }
}

/// Merges a seed's snapshot into the known peers, returning how many were new.
pub(crate) struct MergeSnapshot(pub(crate) Vec<Address>);

impl Message<MergeSnapshot> for PeerView {
    type Reply = usize;

    async fn handle(&mut self, MergeSnapshot(peers): MergeSnapshot, _ctx: Context<'_, Self>) -> usize {
        let added = self
            .known
            .merge(peers.into_iter().filter(|peer| *peer != self.local));
        info!(added, known = self.known.len(), "directory updated");
        added
    }
}

/// Samples known peers that are worth dialing: not this node, not already linked, and no more than the free
/// link slots.
pub(crate) struct SampleCandidates;

impl Message<SampleCandidates> for PeerView {
    type Reply = Vec<Address>;

    async fn handle(&mut self, _: SampleCandidates, _ctx: Context<'_, Self>) -> Vec<Address> {
        let free = self.max_connections.saturating_sub(self.slots_in_use());
        let mut sample = self.known.sample_where(self.max_fanout, &mut self.rng, |peer| {
            *peer != self.local && !self.links.contains_key(peer)
        });
        sample.truncate(free);
        sample
    }
}

/// Claims a link slot for a handshake with `peer`, before anything is sent on the wire.
///
/// A granted reservation is consumed by [`AddLink`] or given back with [`Release`]. `dialer` is `peer` for an
/// inbound `Connect` and this node for an outbound one.
pub(crate) struct Reserve {
    pub(crate) peer: Address,
    pub(crate) dialer: Address,
}

impl Message<Reserve> for PeerView {
    type Reply = bool;

    async fn handle(&mut self, Reserve { peer, dialer }: Reserve, _ctx: Context<'_, Self>) -> bool {
        let key = (peer, dialer);
        let granted = key.0 != self.local
            && !self.pending.contains(&key)
            && self.prefers(&key.0, &key.1)
            && self.has_slot_for(&key.0);
        if granted {
            self.pending.insert(key);
        } else {
            debug!(peer = %key.0, dialer = %key.1, links = self.links.len(), "refusing link");
        }
        granted
    }
}

/// Gives back a reservation whose handshake failed.
pub(crate) struct Release {
    pub(crate) peer: Address,
    pub(crate) dialer: Address,
}

impl Message<Release> for PeerView {
    type Reply = ();

    async fn handle(&mut self, Release { peer, dialer }: Release, _ctx: Context<'_, Self>) {
        self.pending.remove(&(peer, dialer));
    }
}

/// Hands a freshly established link to the view, consuming its reservation. Returns `false` if the link lost the
/// tie-break to a link established in the meantime.
pub(crate) struct AddLink(pub(crate) Link);

impl Message<AddLink> for PeerView {
    type Reply = bool;

    async fn handle(&mut self, AddLink(link): AddLink, _ctx: Context<'_, Self>) -> bool {
        let peer = link.peer().clone();
        let dialer = link.dialer(&self.local).clone();
        let reserved = self.pending.remove(&(peer.clone(), dialer.clone()));
        if peer == self.local || !reserved || !self.prefers(&peer, &dialer) {
            debug!(%peer, link = %link.id(), reserved, "discarding duplicate link");
            return false;
        }

        let direction = link.direction();
        let replaced = self.links.insert(peer.clone(), link);
        self.linked.upsert(peer.clone());
        self.known.upsert(peer.clone());

        match replaced {
            Some(old) => debug!(%peer, old = %old.id(), new = %self.links[&peer].id(), "replaced link"),
            None => {
                info!(%peer, ?direction, links = self.links.len(), "peer connected");
                self.emit(PeerEvent::Connected(peer));
            }
        }
        true
    }
}

/// Originates a gossip message from this node.
pub(crate) struct Originate(pub(crate) String);

impl Message<Originate> for PeerView {
    type Reply = GossipMessage;

    async fn handle(&mut self, Originate(payload): Originate, _ctx: Context<'_, Self>) -> GossipMessage {
        let message = self.gossip.originate(payload);
        let targets = self.gossip.targets(&self.linked, &message, None);
        info!(
            sequence = message.sequence,
            targets = %targets.iter().join(", "),
            "originated gossip"
        );
        self.send_to(&targets, &WireMessage::Gossip(message.clone()));
        message
    }
}

impl Message<InboundGossip> for PeerView {
    type Reply = ();

    async fn handle(&mut self, msg: InboundGossip, _ctx: Context<'_, Self>) {
        let InboundGossip { message, from, link } = msg;
        if !self.gossip.receive(&message) {
            trace!(origin = %message.origin, sequence = message.sequence, %from, "duplicate gossip dropped");
            return;
        }

        self.known.upsert(message.origin.clone());

        let targets = self.gossip.targets(&self.linked, &message, Some(&from));
        debug!(
            origin = %message.origin,
            sequence = message.sequence,
            %from,
            %link,
            relayed_to = %targets.iter().join(", "),
            "gossip received"
        );
        self.send_to(&targets, &WireMessage::Gossip(message.clone()));
        self.emit(PeerEvent::GossipReceived { message, from });
    }
}

impl Message<LivenessUpdate> for PeerView {
    type Reply = ();

    async fn handle(&mut self, update: LivenessUpdate, _ctx: Context<'_, Self>) {
        let current = self.links.get(&update.peer).map(Link::id);
        if current != Some(update.link) {
            trace!(peer = %update.peer, link = %update.link, "liveness update from a closed link");
            return;
        }

        let peer = update.peer;
        match update.state {
            LivenessState::Alive => {
                self.linked.mark_alive(&peer);
                self.known.mark_alive(&peer);
                if let Some(transition) = update.transition {
                    info!(%peer, from = %transition.from, to = %transition.to, "peer recovered");
                }
            }
            LivenessState::Suspected => {
                self.linked.mark_unresponsive(&peer);
                self.known.mark_unresponsive(&peer);
                if let Some(transition) = update.transition {
                    warn!(%peer, from = %transition.from, to = %transition.to, "peer missed a probe");
                }
            }
            LivenessState::Dead => self.declare_dead(peer),
        }
    }
}

/// Every known peer, in address order.
pub(crate) struct KnownPeers;

impl Message<KnownPeers> for PeerView {
    type Reply = Vec<Address>;

    async fn handle(&mut self, _: KnownPeers, _ctx: Context<'_, Self>) -> Vec<Address> {
        self.known.addresses()
    }
}

/// Every linked peer, in address order.
pub(crate) struct LinkedPeers;

impl Message<LinkedPeers> for PeerView {
    type Reply = Vec<Address>;

    async fn handle(&mut self, _: LinkedPeers, _ctx: Context<'_, Self>) -> Vec<Address> {
        self.linked.addresses()
    }
}
