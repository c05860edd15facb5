#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]

pub mod actor;
pub mod address;
pub mod config;
pub mod directory;
pub mod error;
pub mod gossip;
mod link;
pub mod liveness;
mod mailbox;
pub mod message;
pub mod peer;
pub mod seed;
pub mod transport;
pub mod wire;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use address::Address;
pub use config::{MembershipConfig, PeerConfig, SeedConfig, SeedSelection};
pub use error::{MembershipError, Result};
pub use link::LinkId;
pub use peer::{PeerAgent, PeerEvent};
pub use seed::SeedCoordinator;

/// Current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
