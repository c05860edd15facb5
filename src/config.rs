//! Node configuration.

use std::{collections::HashSet, time::Duration};

use crate::{
    address::Address,
    directory::DEFAULT_MAX_SAMPLE,
    error::{MembershipError, Result},
    gossip::DEFAULT_SEEN_WINDOW,
    liveness::MIN_MISSED_PROBES,
    transport::DEFAULT_CONNECT_TIMEOUT,
    wire::DEFAULT_MAX_FRAME_LEN,
};

/// Default cap on simultaneous links per peer.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Default gossip interval in seconds.
pub const DEFAULT_GOSSIP_INTERVAL_SECS: u64 = 5;

/// Default number of scheduled gossip messages per node.
pub const DEFAULT_GOSSIP_ROUNDS: u64 = 10;

/// Default liveness probe interval in seconds.
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 13;

/// Default time to wait for a pong, in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default time a seed keeps a silent connection open, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default outbound queue length per link.
pub const DEFAULT_LINK_BUFFER: usize = 64;

/// Tuning of the membership, gossip and liveness protocols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipConfig {
    /// Upper bound on peers dialed after bootstrap and on gossip targets per message.
    pub max_fanout: usize,
    /// Links beyond this many are rejected at handshake.
    pub max_connections: usize,
    /// Interval between scheduled gossip messages.
    pub gossip_interval: Duration,
    /// Number of scheduled gossip messages to originate, or `None` to gossip until shutdown.
    pub gossip_rounds: Option<u64>,
    /// Interval between liveness probes on each link.
    pub probe_interval: Duration,
    /// Time to wait for the pong to a probe.
    pub probe_timeout: Duration,
    /// Consecutive missed probes before a peer is declared dead. Never below 2.
    pub max_missed_probes: u32,
    /// Time allowed to establish a connection or receive a handshake reply.
    pub connect_timeout: Duration,
    /// Sequence numbers remembered per gossip origin for duplicate suppression.
    pub seen_window: u64,
    /// Largest accepted frame body in bytes.
    pub max_frame_len: usize,
    /// Outbound frames queued per link before further sends are dropped.
    pub link_buffer: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            max_fanout: DEFAULT_MAX_SAMPLE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            gossip_interval: Duration::from_secs(DEFAULT_GOSSIP_INTERVAL_SECS),
            gossip_rounds: Some(DEFAULT_GOSSIP_ROUNDS),
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            max_missed_probes: MIN_MISSED_PROBES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            seen_window: DEFAULT_SEEN_WINDOW,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            link_buffer: DEFAULT_LINK_BUFFER,
        }
    }
}

impl MembershipConfig {
    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<()> {
        if self.max_missed_probes < MIN_MISSED_PROBES {
            return Err(MembershipError::InvalidConfig(format!(
                "max_missed_probes must be at least {MIN_MISSED_PROBES}, got {}",
                self.max_missed_probes
            )));
        }
        if self.max_fanout == 0 {
            return Err(invalid("max_fanout must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be greater than 0"));
        }
        if self.gossip_interval.is_zero() {
            return Err(invalid("gossip_interval must be greater than 0"));
        }
        if self.probe_interval.is_zero() {
            return Err(invalid("probe_interval must be greater than 0"));
        }
        if self.probe_timeout.is_zero() {
            return Err(invalid("probe_timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout must be greater than 0"));
        }
        if self.seen_window == 0 {
            return Err(invalid("seen_window must be greater than 0"));
        }
        if self.max_frame_len == 0 {
            return Err(invalid("max_frame_len must be greater than 0"));
        }
        if self.link_buffer == 0 {
            return Err(invalid("link_buffer must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> MembershipError {
    MembershipError::InvalidConfig(reason.to_string())
}

/// Which of the configured seeds a peer registers with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeedSelection {
    /// Every configured seed.
    #[default]
    All,
    /// A random `floor(n / 2) + 1` of the `n` configured seeds.
    Majority,
}

impl SeedSelection {
    /// Number of seeds to register with out of `available`.
    pub fn count(&self, available: usize) -> usize {
        match self {
            SeedSelection::All => available,
            SeedSelection::Majority if available == 0 => 0,
            SeedSelection::Majority => available / 2 + 1,
        }
    }
}

/// Configuration of a peer agent.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Address to listen on. Port 0 picks a free port; the bound port is what gets advertised.
    pub listen: Address,
    /// Seed coordinators to bootstrap from.
    pub seeds: Vec<Address>,
    /// Which seeds to register with.
    pub seed_selection: SeedSelection,
    /// Seeds the node's RNG, making sampling reproducible. Random if `None`.
    pub rng_seed: Option<u64>,
    /// Protocol tuning.
    pub membership: MembershipConfig,
}

impl PeerConfig {
    /// Creates a configuration with default tuning.
    pub fn new(listen: Address, seeds: Vec<Address>) -> Self {
        PeerConfig {
            listen,
            seeds,
            seed_selection: SeedSelection::default(),
            rng_seed: None,
            membership: MembershipConfig::default(),
        }
    }

    /// Checks that the peer has somewhere to bootstrap from and that its tuning is in range.
    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(invalid("at least one seed address is required"));
        }
        self.membership.validate()
    }
}

/// Configuration of a seed coordinator.
#[derive(Clone, Debug)]
pub struct SeedConfig {
    /// Address to listen on.
    pub listen: Address,
    /// Largest accepted frame body in bytes.
    pub max_frame_len: usize,
    /// A connection that sends nothing for this long is closed.
    pub idle_timeout: Duration,
}

impl SeedConfig {
    /// Creates a configuration with the default frame limit and idle timeout.
    pub fn new(listen: Address) -> Self {
        SeedConfig {
            listen,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Parses a seed list: one `host:port` per line.
///
/// Blank lines and lines starting with `#` are skipped, and repeated addresses are kept once, in first-seen order.
pub fn parse_seed_list(text: &str) -> Result<Vec<Address>> {
    let mut seen = HashSet::new();
    let mut seeds = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let address: Address = line.parse()?;
        if seen.insert(address.clone()) {
            seeds.push(address);
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MembershipConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_fanout, 4);
        assert_eq!(config.max_missed_probes, 2);
        assert_eq!(config.gossip_rounds, Some(10));
    }

    #[test]
    fn single_miss_threshold_is_rejected() {
        let config = MembershipConfig {
            max_missed_probes: 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_missed_probes"), "{err}");
    }

    #[test]
    fn zero_values_are_rejected() {
        let cases = [
            MembershipConfig {
                max_fanout: 0,
                ..Default::default()
            },
            MembershipConfig {
                max_connections: 0,
                ..Default::default()
            },
            MembershipConfig {
                probe_interval: Duration::ZERO,
                ..Default::default()
            },
            MembershipConfig {
                seen_window: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(MembershipError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn peer_without_seeds_is_rejected() {
        let config = PeerConfig::new(Address::new("127.0.0.1", 0), Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn majority_of_seeds() {
        assert_eq!(SeedSelection::Majority.count(0), 0);
        assert_eq!(SeedSelection::Majority.count(1), 1);
        assert_eq!(SeedSelection::Majority.count(2), 2);
        assert_eq!(SeedSelection::Majority.count(3), 2);
        assert_eq!(SeedSelection::Majority.count(5), 3);
        assert_eq!(SeedSelection::All.count(5), 5);
    }

    #[test]
    fn seed_list_skips_comments_and_duplicates() {
        let text = "\
# seeds
10.0.0.1:7000

10.0.0.2:7000
  10.0.0.1:7000
[::1]:7001
";
        let seeds = parse_seed_list(text).unwrap();
        assert_eq!(
            seeds,
            vec![
                Address::new("10.0.0.1", 7000),
                Address::new("10.0.0.2", 7000),
                Address::new("::1", 7001),
            ]
        );
    }

    #[test]
    fn seed_list_reports_bad_lines() {
        let err = parse_seed_list("10.0.0.1:7000\nnot-an-address\n").unwrap_err();
        assert!(matches!(err, MembershipError::InvalidAddress(_)));
    }
}
