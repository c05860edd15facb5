//! Failure detection for linked peers.
//!
//! Each link is watched by its own probe task, so a slow peer never delays the probes of another. The task sends
//! a `Ping` every probe interval and feeds the outcome into a [`LivenessDetector`]:
//!
//! ```text
//! ALIVE --miss--> SUSPECTED --miss--> DEAD (terminal)
//!   ^                 |
//!   +-----answer------+
//! ```
//!
//! A single dropped probe only ever produces `SUSPECTED`. Once `DEAD` is reached the task reports one final
//! [`LivenessUpdate`] and exits; turning that into a [`DeadNodeReport`] is the owner's job.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tracing::trace;

use crate::{
    actor::ActorRef,
    address::Address,
    current_timestamp_millis,
    link::LinkId,
    message::Message,
    wire::WireMessage,
};

/// Smallest number of consecutive missed probes that may declare a peer dead.
pub const MIN_MISSED_PROBES: u32 = 2;

/// Liveness of one monitored peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LivenessState {
    /// The last probe was answered.
    Alive,
    /// At least one probe in a row went unanswered.
    Suspected,
    /// Enough consecutive probes went unanswered; terminal.
    Dead,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessState::Alive => write!(f, "alive"),
            LivenessState::Suspected => write!(f, "suspected"),
            LivenessState::Dead => write!(f, "dead"),
        }
    }
}

/// A change of [`LivenessState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before the probe outcome.
    pub from: LivenessState,
    /// State after the probe outcome.
    pub to: LivenessState,
}

/// The per-peer liveness state machine.
#[derive(Clone, Debug)]
pub struct LivenessDetector {
    state: LivenessState,
    consecutive_misses: u32,
    max_missed: u32,
}

impl LivenessDetector {
    /// Creates a detector that declares death after `max_missed` consecutive misses.
    ///
    /// Values below [`MIN_MISSED_PROBES`] are raised to it.
    pub fn new(max_missed: u32) -> Self {
        LivenessDetector {
            state: LivenessState::Alive,
            consecutive_misses: 0,
            max_missed: max_missed.max(MIN_MISSED_PROBES),
        }
    }

    /// Current state.
    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Number of probes missed in a row.
    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// Records an answered probe.
    pub fn record_success(&mut self) -> Option<Transition> {
        if self.state == LivenessState::Dead {
            return None;
        }
        self.consecutive_misses = 0;
        self.transition_to(LivenessState::Alive)
    }

    /// Records an unanswered probe.
    pub fn record_failure(&mut self) -> Option<Transition> {
        if self.state == LivenessState::Dead {
            return None;
        }
        self.consecutive_misses += 1;
        if self.consecutive_misses >= self.max_missed {
            self.transition_to(LivenessState::Dead)
        } else {
            self.transition_to(LivenessState::Suspected)
        }
    }

    fn transition_to(&mut self, to: LivenessState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(Transition { from, to })
    }
}

impl Default for LivenessDetector {
    fn default() -> Self {
        LivenessDetector::new(MIN_MISSED_PROBES)
    }
}

/// A peer declared dead, to be delivered to the seed coordinators exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadNodeReport {
    /// The peer that detected the failure.
    pub reporter: Address,
    /// The peer that stopped answering.
    pub reported: Address,
    /// Unix timestamp in milliseconds of the detection.
    pub detected_at: u64,
}

impl DeadNodeReport {
    /// Creates a report stamped with the current time.
    pub fn new(reporter: Address, reported: Address) -> Self {
        DeadNodeReport {
            reporter,
            reported,
            detected_at: current_timestamp_millis(),
        }
    }
}

/// Outcome of one probe round, sent to whoever owns the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessUpdate {
    /// The probed peer.
    pub peer: Address,
    /// The link the probe travelled on.
    pub link: LinkId,
    /// State after this round.
    pub state: LivenessState,
    /// Set if this round changed the state.
    pub transition: Option<Transition>,
}

/// Sends pings over a link and waits for the matching pongs.
#[derive(Debug)]
pub(crate) struct Prober {
    outbound: mpsc::Sender<WireMessage>,
    pongs: mpsc::Receiver<u64>,
    timeout: Duration,
    next_nonce: u64,
}

impl Prober {
    pub(crate) fn new(
        outbound: mpsc::Sender<WireMessage>,
        pongs: mpsc::Receiver<u64>,
        timeout: Duration,
    ) -> Self {
        Prober {
            outbound,
            pongs,
            timeout,
            next_nonce: 0,
        }
    }

    /// Returns `true` if the pong for a fresh ping arrived within the timeout.
    ///
    /// A link whose writer or reader has gone away can never answer, so it fails immediately.
    pub(crate) async fn probe(&mut self) -> bool {
        self.next_nonce += 1;
        let nonce = self.next_nonce;
        let outbound = &self.outbound;
        let pongs = &mut self.pongs;

        let exchange = async move {
            if outbound.send(WireMessage::Ping { nonce }).await.is_err() {
                return false;
            }
            while let Some(answered) = pongs.recv().await {
                if answered == nonce {
                    return true;
                }
                trace!(answered, expected = nonce, "discarding late pong");
            }
            false
        };

        time::timeout(self.timeout, exchange).await.unwrap_or(false)
    }
}

/// Probes one peer every `probe_interval` until it is declared dead or `observer` stops.
pub(crate) async fn monitor<A>(
    peer: Address,
    link: LinkId,
    mut prober: Prober,
    probe_interval: Duration,
    max_missed: u32,
    observer: ActorRef<A>,
) where
    A: Message<LivenessUpdate>,
{
    let mut detector = LivenessDetector::new(max_missed);
    let mut ticker = time::interval(probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; a fresh link needs no probe.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let transition = if prober.probe().await {
            detector.record_success()
        } else {
            detector.record_failure()
        };

        let update = LivenessUpdate {
            peer: peer.clone(),
            link,
            state: detector.state(),
            transition,
        };
        if observer.tell(update).await.is_err() {
            return;
        }
        if detector.state() == LivenessState::Dead {
            return;
        }
    }
}
