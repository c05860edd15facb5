//! The peer agent: one running peer node.
//!
//! Starting an agent binds its listener, registers with the configured seed coordinators, merges their snapshots
//! into the local view and dials a random sample of the peers it learned about. From then on these activities run
//! concurrently until [`PeerAgent::shutdown`]:
//!
//! - the accept loop, handing each inbound connection to its own handshake task,
//! - the gossip loop, originating a message every gossip interval,
//! - one liveness monitor per link,
//! - the reporter, delivering dead-node reports to the seeds.
//!
//! All local state is owned by a single view actor. The loops talk to it with messages and never share memory.

mod view;

use std::{future::Future, time::Duration};

use futures::{
    future::{self, AbortHandle, Abortable},
    StreamExt,
};
use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    actor::{self, ActorRef},
    address::Address,
    config::{PeerConfig, SeedSelection},
    directory::DirectorySnapshot,
    error::{MembershipError, Result},
    gossip::{self, GossipDisseminator, GossipMessage},
    link::{Link, LinkDirection, LinkSettings},
    liveness::DeadNodeReport,
    transport::{Connection, Endpoint, Incoming},
    wire::WireMessage,
};

use self::view::{
    AddLink, KnownPeers, LinkedPeers, MergeSnapshot, Originate, PeerView, Release, Reserve,
    SampleCandidates,
};

const EVENT_CAPACITY: usize = 256;

/// Something that happened to a peer agent, delivered to every [`subscribe`](PeerAgent::subscribe)r.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A link to this peer was established.
    Connected(Address),
    /// The link to this peer is gone.
    Disconnected(Address),
    /// A gossip message was delivered for the first time.
    GossipReceived {
        /// The message.
        message: GossipMessage,
        /// The linked peer that forwarded it.
        from: Address,
    },
    /// A linked peer stopped answering probes and was reported to the seeds.
    PeerDead(DeadNodeReport),
}

/// A running peer node.
#[derive(Debug)]
pub struct PeerAgent {
    address: Address,
    seeds: Vec<Address>,
    endpoint: Endpoint,
    settings: LinkSettings,
    view: ActorRef<PeerView>,
    events: broadcast::Sender<PeerEvent>,
    tasks: Vec<AbortHandle>,
}

impl PeerAgent {
    /// Starts a peer: listen, bootstrap from the seeds, dial a sample of peers and start the background loops.
    ///
    /// Fails with [`MembershipError::BootstrapFailed`] if none of the selected seeds answered. Failing to reach
    /// individual peers is logged and otherwise ignored; a peer with no links keeps running, isolated.
    pub async fn start(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        let membership = &config.membership;
        let endpoint = Endpoint::new(membership.connect_timeout, membership.max_frame_len);
        let settings = LinkSettings::from(membership);
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::random()),
        };

        let incoming = endpoint.listen(&config.listen).await?;
        let address = incoming.local_address().clone();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let gossip = GossipDisseminator::new(
            address.clone(),
            membership.max_fanout,
            membership.seen_window,
            StdRng::seed_from_u64(rng.random()),
        );
        let view = actor::spawn(PeerView::new(
            address.clone(),
            membership,
            gossip,
            StdRng::seed_from_u64(rng.random()),
            events.clone(),
            reports_tx,
        ));

        // Any early return from here on drops the agent, which aborts every task started so far.
        let mut agent = PeerAgent {
            address: address.clone(),
            seeds: Vec::new(),
            endpoint,
            settings,
            view,
            events,
            tasks: Vec::new(),
        };

        // Registering advertises this node, so be ready for inbound links first.
        agent.tasks.push(spawn_abortable(accept_loop(
            incoming,
            address.clone(),
            endpoint,
            settings,
            agent.view.clone(),
        )));

        let (seeds, snapshot) =
            bootstrap(&endpoint, &address, &config.seeds, config.seed_selection, &mut rng).await?;
        agent.seeds = seeds;
        agent
            .tasks
            .push(spawn_abortable(report_loop(reports_rx, endpoint, agent.seeds.clone())));

        agent.view.ask(MergeSnapshot(snapshot)).await?;
        let candidates = agent.view.ask(SampleCandidates).await?;
        let dials = candidates
            .iter()
            .map(|peer| connect(&endpoint, &address, peer, settings, &agent.view));
        for (peer, result) in candidates.iter().zip(future::join_all(dials).await) {
            if let Err(err) = result {
                warn!(%peer, error = %err, "failed to connect to peer");
            }
        }

        agent.tasks.push(spawn_abortable(gossip_loop(
            agent.view.clone(),
            address.clone(),
            membership.gossip_interval,
            membership.gossip_rounds,
        )));

        info!(%address, seeds = agent.seeds.len(), "peer agent started");
        Ok(agent)
    }

    /// The address this peer advertises.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The seeds this peer registered with. Dead-node reports go to each of them.
    pub fn seeds(&self) -> &[Address] {
        &self.seeds
    }

    /// Subscribes to this peer's events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Every peer this node has learned about, in address order.
    pub async fn known_peers(&self) -> Result<Vec<Address>> {
        Ok(self.view.ask(KnownPeers).await?)
    }

    /// Every peer this node currently has a link to, in address order.
    pub async fn connected_peers(&self) -> Result<Vec<Address>> {
        Ok(self.view.ask(LinkedPeers).await?)
    }

    /// Originates a gossip message with `payload` and sends it to a random subset of linked peers.
    pub async fn gossip(&self, payload: impl Into<String>) -> Result<GossipMessage> {
        Ok(self.view.ask(Originate(payload.into())).await?)
    }

    /// Dials `peer` and establishes a link, unless it rejects the handshake.
    ///
    /// Fails with [`MembershipError::LinkRefused`] without dialing when every link slot is taken, or when the
    /// existing link to `peer` was dialed by the lower address.
    pub async fn connect(&self, peer: &Address) -> Result<()> {
        connect(&self.endpoint, &self.address, peer, self.settings, &self.view).await
    }

    /// Stops every loop and closes every link.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        let _ = self.view.stop_gracefully().await;
        self.view.wait_for_stop().await;
        info!(address = %self.address, "peer agent stopped");
    }

    /// Runs until `signal` completes, then shuts down.
    ///
    /// ```no_run
    /// # async fn run(agent: seedmesh::peer::PeerAgent) {
    /// agent.run_until(tokio::signal::ctrl_c()).await;
    /// # }
    /// ```
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future,
    {
        signal.await;
        info!(address = %self.address, "shutdown requested");
        self.shutdown().await;
    }
}

impl Drop for PeerAgent {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_abortable<F>(fut: F) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let (handle, registration) = AbortHandle::new_pair();
    tokio::spawn(Abortable::new(fut, registration));
    handle
}

/// Registers with the selected seeds, returning the seeds that answered and everything they returned.
async fn bootstrap(
    endpoint: &Endpoint,
    local: &Address,
    seeds: &[Address],
    selection: SeedSelection,
    rng: &mut StdRng,
) -> Result<(Vec<Address>, DirectorySnapshot)> {
    let selected: Vec<Address> = match selection {
        SeedSelection::All => seeds.to_vec(),
        SeedSelection::Majority => index::sample(rng, seeds.len(), selection.count(seeds.len()))
            .into_iter()
            .map(|i| seeds[i].clone())
            .collect(),
    };

    let mut registered = Vec::new();
    let mut peers = Vec::new();
    for seed in &selected {
        match register(endpoint, local, seed).await {
            Ok(snapshot) => {
                info!(%seed, peers = snapshot.len(), "registered with seed");
                registered.push(seed.clone());
                peers.extend(snapshot);
            }
            Err(err) => warn!(%seed, error = %err, "seed unreachable"),
        }
    }

    if registered.is_empty() {
        error!(attempted = selected.len(), "no seed coordinator reachable");
        return Err(MembershipError::BootstrapFailed {
            attempted: selected.len(),
        });
    }
    Ok((registered, peers))
}

async fn register(endpoint: &Endpoint, local: &Address, seed: &Address) -> Result<DirectorySnapshot> {
    let mut conn = endpoint.dial(seed).await?;
    let register = WireMessage::Register {
        address: local.clone(),
    };
    match conn.request(&register, endpoint.connect_timeout()).await? {
        WireMessage::Snapshot { peers } => Ok(peers),
        other => Err(other.unexpected("Snapshot")),
    }
}

async fn connect(
    endpoint: &Endpoint,
    local: &Address,
    peer: &Address,
    settings: LinkSettings,
    view: &ActorRef<PeerView>,
) -> Result<()> {
    let reservation = Reserve {
        peer: peer.clone(),
        dialer: local.clone(),
    };
    if !view.ask(reservation).await? {
        return Err(MembershipError::LinkRefused(peer.clone()));
    }

    let result = dial_link(endpoint, local, peer, settings, view).await;
    if result.is_err() {
        let release = Release {
            peer: peer.clone(),
            dialer: local.clone(),
        };
        let _ = view.tell(release).await;
    }
    result
}

async fn dial_link(
    endpoint: &Endpoint,
    local: &Address,
    peer: &Address,
    settings: LinkSettings,
    view: &ActorRef<PeerView>,
) -> Result<()> {
    let mut conn = endpoint.dial(peer).await?;
    let hello = WireMessage::Connect {
        address: local.clone(),
    };
    match conn.request(&hello, endpoint.connect_timeout()).await? {
        WireMessage::ConnectAccepted => {}
        WireMessage::ConnectRejected => return Err(MembershipError::ConnectionRejected(peer.clone())),
        other => return Err(other.unexpected("ConnectAccepted or ConnectRejected")),
    }

    let link = Link::spawn(conn, peer.clone(), LinkDirection::Outbound, settings, view.clone());
    view.ask(AddLink(link)).await?;
    Ok(())
}

async fn accept_loop(
    mut incoming: Incoming,
    local: Address,
    endpoint: Endpoint,
    settings: LinkSettings,
    view: ActorRef<PeerView>,
) {
    // Handshakes live in the set so that aborting the loop aborts them too.
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            accepted = incoming.next() => match accepted {
                Some(Ok(conn)) => {
                    handshakes.spawn(accept_link(conn, local.clone(), endpoint, settings, view.clone()));
                }
                Some(Err(err)) => error!(error = %err, "failed to accept connection"),
                None => break,
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

async fn accept_link(
    conn: Connection,
    local: Address,
    endpoint: Endpoint,
    settings: LinkSettings,
    view: ActorRef<PeerView>,
) {
    let remote = conn.remote_addr();
    match handshake(conn, endpoint, settings, &view).await {
        Ok(()) => {}
        Err(err) if err.is_protocol_error() => {
            warn!(%local, %remote, error = %err, "malformed handshake, closing connection");
        }
        Err(err) => debug!(%local, %remote, error = %err, "inbound handshake failed"),
    }
}

async fn handshake(
    mut conn: Connection,
    endpoint: Endpoint,
    settings: LinkSettings,
    view: &ActorRef<PeerView>,
) -> Result<()> {
    let peer = match conn.recv_timeout(endpoint.connect_timeout()).await? {
        WireMessage::Connect { address } => address,
        other => return Err(other.unexpected("Connect")),
    };
    if !peer.is_dialable() {
        return Err(MembershipError::InvalidAddress(peer.to_string()));
    }

    let reservation = Reserve {
        peer: peer.clone(),
        dialer: peer.clone(),
    };
    if !view.ask(reservation).await? {
        conn.send(&WireMessage::ConnectRejected).await?;
        return Ok(());
    }
    if let Err(err) = conn.send(&WireMessage::ConnectAccepted).await {
        let release = Release {
            peer: peer.clone(),
            dialer: peer,
        };
        let _ = view.tell(release).await;
        return Err(err);
    }

    let link = Link::spawn(conn, peer, LinkDirection::Inbound, settings, view.clone());
    view.ask(AddLink(link)).await?;
    Ok(())
}

async fn gossip_loop(
    view: ActorRef<PeerView>,
    local: Address,
    interval: Duration,
    rounds: Option<u64>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut round = 0;
    while rounds.map_or(true, |rounds| round < rounds) {
        ticker.tick().await;
        round += 1;
        let payload = gossip::scheduled_payload(&local, round);
        if view.ask(Originate(payload)).await.is_err() {
            return;
        }
    }
    debug!(%local, rounds = round, "gossip schedule complete");
}

async fn report_loop(
    mut reports: mpsc::UnboundedReceiver<DeadNodeReport>,
    endpoint: Endpoint,
    seeds: Vec<Address>,
) {
    while let Some(report) = reports.recv().await {
        for seed in &seeds {
            match send_report(&endpoint, seed, &report).await {
                Ok(()) => info!(%seed, peer = %report.reported, "reported dead peer"),
                Err(err) => {
                    warn!(%seed, peer = %report.reported, error = %err, "failed to report dead peer")
                }
            }
        }
    }
}

async fn send_report(endpoint: &Endpoint, seed: &Address, report: &DeadNodeReport) -> Result<()> {
    let mut conn = endpoint.dial(seed).await?;
    conn.send(&WireMessage::DeadNode(report.clone())).await
}
