//! Defines error handling constructs for seedmesh.
//!
//! Errors fall into a few families: transport failures (refused, reset, timed out), protocol failures
//! (a frame that cannot be decoded or arrives out of turn), bootstrap failure (no seed coordinator could be
//! reached), and actor delivery failures. Transport and protocol errors are always contained to the connection
//! they occurred on; only bootstrap failure is surfaced as fatal, and only at startup.

use std::{fmt, io};

use thiserror::Error;

use crate::address::Address;

/// Error that can occur when sending a message to an actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The actor isn't running.
    #[error("actor not running")]
    ActorNotRunning,
    /// The actor was stopped before a reply could be received.
    #[error("actor stopped")]
    ActorStopped,
}

/// Reason for an actor being stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActorStopReason {
    /// Actor stopped normally, after a stop signal.
    Normal,
    /// Every actor ref was dropped, so no further messages can arrive.
    MailboxClosed,
}

impl fmt::Display for ActorStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorStopReason::Normal => write!(f, "actor stopped normally"),
            ActorStopReason::MailboxClosed => write!(f, "all actor refs dropped"),
        }
    }
}

/// Errors produced by the membership, gossip and liveness core.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// Connection refused, reset, or any other socket failure.
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// A frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A frame body could not be deserialized.
    #[error("malformed frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A frame announced a length above the configured maximum.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Announced frame length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A well-formed frame arrived where the protocol expects a different one.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the protocol expected at this point.
        expected: &'static str,
        /// The kind of frame actually received.
        got: &'static str,
    },

    /// The remote did not answer in time.
    #[error("connection timeout")]
    Timeout,

    /// The remote closed the connection before the exchange completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote peer refused the connection handshake.
    #[error("connection rejected by {0}")]
    ConnectionRejected(Address),

    /// This node has no free link slot for the peer, or already holds a link that wins over a new one.
    #[error("link to {0} refused locally")]
    LinkRefused(Address),

    /// A `host:port` string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// None of the configured seed coordinators could be reached.
    #[error("bootstrap failed: no seed coordinator reachable ({attempted} attempted)")]
    BootstrapFailed {
        /// Number of seeds that were dialed.
        attempted: usize,
    },

    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An internal actor could not be reached.
    #[error(transparent)]
    Send(#[from] SendError),
}

impl MembershipError {
    /// Returns `true` for errors caused by the remote speaking the protocol incorrectly.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MembershipError::Decode(_)
                | MembershipError::FrameTooLarge { .. }
                | MembershipError::UnexpectedMessage { .. }
                | MembershipError::InvalidAddress(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MembershipError>;
