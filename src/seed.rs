//! The seed coordinator: a bootstrap directory peers register with.
//!
//! The authoritative [`PeerDirectory`] lives inside a [`SeedDirectory`] actor, so registrations and dead-node
//! removals arriving on many connections at once are applied one at a time. Each inbound connection gets its own
//! task, which may carry any number of `Register` and `DeadNode` frames. Anything else closes the connection, and so
//! does a connection that stays silent for the configured idle timeout.

use std::time::Duration;

use futures::{
    future::{AbortHandle, Abortable},
    StreamExt,
};
use tokio::{task::JoinSet, time};
use tracing::{debug, error, info, warn};

use crate::{
    actor::{self, Actor, ActorRef},
    address::Address,
    config::SeedConfig,
    directory::{DirectorySnapshot, PeerDirectory, Upsert},
    error::{MembershipError, Result},
    liveness::DeadNodeReport,
    message::{Context, Message},
    transport::{Connection, Endpoint, Incoming, DEFAULT_CONNECT_TIMEOUT},
    wire::WireMessage,
};

/// A running seed coordinator.
///
/// Dropping the coordinator stops accepting connections; [`shutdown`](SeedCoordinator::shutdown) also waits for
/// the directory to stop.
#[derive(Debug)]
pub struct SeedCoordinator {
    address: Address,
    directory: ActorRef<SeedDirectory>,
    server: AbortHandle,
}

impl SeedCoordinator {
    /// Binds the listen address and starts serving registrations.
    pub async fn start(config: SeedConfig) -> Result<Self> {
        let endpoint = Endpoint::new(DEFAULT_CONNECT_TIMEOUT, config.max_frame_len);
        let incoming = endpoint.listen(&config.listen).await?;
        let address = incoming.local_address().clone();

        let directory = actor::spawn(SeedDirectory::default());
        let (server, registration) = AbortHandle::new_pair();
        tokio::spawn(Abortable::new(
            serve(incoming, directory.clone(), config.idle_timeout),
            registration,
        ));

        info!(%address, "seed coordinator started");
        Ok(SeedCoordinator {
            address,
            directory,
            server,
        })
    }

    /// The address peers should register with.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Adds or refreshes `address`, returning every other known peer.
    pub async fn register(&self, address: Address) -> Result<DirectorySnapshot> {
        Ok(self.directory.ask(Register(address)).await?)
    }

    /// Applies a dead-node report. Returns `false` if the peer was already absent.
    pub async fn report_dead(&self, report: DeadNodeReport) -> Result<bool> {
        Ok(self.directory.ask(ReportDead(report)).await?)
    }

    /// Every registered peer, in address order.
    pub async fn peers(&self) -> Result<Vec<Address>> {
        Ok(self.directory.ask(Peers).await?)
    }

    /// Stops accepting connections and stops the directory.
    pub async fn shutdown(self) {
        self.server.abort();
        let _ = self.directory.stop_gracefully().await;
        self.directory.wait_for_stop().await;
        info!(address = %self.address, "seed coordinator stopped");
    }
}

impl Drop for SeedCoordinator {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(mut incoming: Incoming, directory: ActorRef<SeedDirectory>, idle_timeout: Duration) {
    // Handlers live in the set so that aborting the server aborts them too.
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = incoming.next() => match accepted {
                Some(Ok(conn)) => {
                    handlers.spawn(handle_connection(conn, directory.clone(), idle_timeout));
                }
                Some(Err(err)) => error!(error = %err, "failed to accept connection"),
                None => break,
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }
}

async fn handle_connection(
    mut conn: Connection,
    directory: ActorRef<SeedDirectory>,
    idle_timeout: Duration,
) {
    let remote = conn.remote_addr();
    match serve_connection(&mut conn, &directory, idle_timeout).await {
        Ok(()) => debug!(%remote, "connection closed"),
        Err(MembershipError::Timeout) => debug!(%remote, ?idle_timeout, "connection idle, closing"),
        Err(err) if err.is_protocol_error() => {
            warn!(%remote, error = %err, "malformed request, closing connection");
        }
        Err(err) => debug!(%remote, error = %err, "connection failed"),
    }
}

async fn serve_connection(
    conn: &mut Connection,
    directory: &ActorRef<SeedDirectory>,
    idle_timeout: Duration,
) -> Result<()> {
    loop {
        let msg = match time::timeout(idle_timeout, conn.recv()).await {
            Ok(received) => match received? {
                Some(msg) => msg,
                None => return Ok(()),
            },
            Err(_) => return Err(MembershipError::Timeout),
        };
        match msg {
            WireMessage::Register { address } => {
                if !address.is_dialable() {
                    return Err(MembershipError::InvalidAddress(address.to_string()));
                }
                let peers = directory.ask(Register(address)).await?;
                conn.send(&WireMessage::Snapshot { peers }).await?;
            }
            WireMessage::DeadNode(report) => {
                directory.tell(ReportDead(report)).await?;
            }
            other => return Err(other.unexpected("Register or DeadNode")),
        }
    }
}

/// Owner of a seed's authoritative directory.
#[derive(Debug, Default)]
pub(crate) struct SeedDirectory {
    peers: PeerDirectory,
}

impl Actor for SeedDirectory {
    fn name() -> &'static str {
        "SeedDirectory"
    }
}

pub(crate) struct Register(pub(crate) Address);

impl Message<Register> for SeedDirectory {
    type Reply = DirectorySnapshot;

    async fn handle(&mut self, Register(address): Register, _ctx: Context<'_, Self>) -> Self::Reply {
        let snapshot = self.peers.snapshot_excluding(&address);
        match self.peers.upsert(address.clone()) {
            Upsert::Inserted => {
                info!(peer = %address, known = self.peers.len(), "peer registered");
            }
            Upsert::Refreshed => debug!(peer = %address, "peer re-registered"),
        }
        snapshot
    }
}

pub(crate) struct ReportDead(pub(crate) DeadNodeReport);

impl Message<ReportDead> for SeedDirectory {
    type Reply = bool;

    async fn handle(&mut self, ReportDead(report): ReportDead, _ctx: Context<'_, Self>) -> Self::Reply {
        match self.peers.remove(&report.reported) {
            Some(_) => {
                info!(
                    peer = %report.reported,
                    reporter = %report.reporter,
                    detected_at = report.detected_at,
                    known = self.peers.len(),
                    "removed dead peer"
                );
                true
            }
            None => {
                debug!(peer = %report.reported, reporter = %report.reporter, "dead peer already removed");
                false
            }
        }
    }
}

pub(crate) struct Peers;

impl Message<Peers> for SeedDirectory {
    type Reply = Vec<Address>;

    async fn handle(&mut self, _: Peers, _ctx: Context<'_, Self>) -> Self::Reply {
        self.peers.addresses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let directory = actor::spawn(SeedDirectory::default());
        assert!(directory.ask(Register(addr(1))).await.unwrap().is_empty());
        assert_eq!(directory.ask(Register(addr(2))).await.unwrap(), vec![addr(1)]);
        assert_eq!(directory.ask(Register(addr(1))).await.unwrap(), vec![addr(2)]);
        assert_eq!(directory.ask(Peers).await.unwrap(), vec![addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn report_for_unknown_peer_is_a_noop() {
        let directory = actor::spawn(SeedDirectory::default());
        directory.ask(Register(addr(1))).await.unwrap();

        let stranger = DeadNodeReport::new(addr(1), addr(9));
        assert!(!directory.ask(ReportDead(stranger)).await.unwrap());

        let report = DeadNodeReport::new(addr(2), addr(1));
        assert!(directory.ask(ReportDead(report.clone())).await.unwrap());
        assert!(!directory.ask(ReportDead(report)).await.unwrap());
        assert!(directory.ask(Peers).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_registrations_never_duplicate() {
        let directory = actor::spawn(SeedDirectory::default());
        let mut tasks = JoinSet::new();
        for i in 0..64u16 {
            let directory = directory.clone();
            tasks.spawn(async move { directory.ask(Register(addr(i % 8))).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(directory.ask(Peers).await.unwrap().len(), 8);
    }
}
