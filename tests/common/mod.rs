use std::future::Future;
use std::time::{Duration, Instant};

use seedmesh::address::Address;
use seedmesh::config::{MembershipConfig, PeerConfig, SeedConfig};
use seedmesh::peer::{PeerAgent, PeerEvent};
use seedmesh::seed::SeedCoordinator;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn localhost() -> Address {
    Address::new("127.0.0.1", 0)
}

/// Probes every 100ms and no scheduled gossip, so tests drive gossip explicitly.
#[allow(dead_code)]
pub fn fast_membership() -> MembershipConfig {
    MembershipConfig {
        gossip_interval: Duration::from_secs(3600),
        gossip_rounds: Some(0),
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub async fn start_seed() -> Result<SeedCoordinator, Box<dyn std::error::Error>> {
    Ok(SeedCoordinator::start(SeedConfig::new(localhost())).await?)
}

#[allow(dead_code)]
pub async fn start_peer(
    seed: &Address,
    membership: MembershipConfig,
) -> Result<PeerAgent, Box<dyn std::error::Error>> {
    let mut config = PeerConfig::new(localhost(), vec![seed.clone()]);
    config.membership = membership;
    Ok(PeerAgent::start(config).await?)
}

#[allow(dead_code)]
pub async fn wait_for_condition<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    check().await
}

/// Waits for the first event matching `pred`, skipping everything else.
#[allow(dead_code)]
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PeerEvent>,
    timeout: Duration,
    mut pred: F,
) -> Option<PeerEvent>
where
    F: FnMut(&PeerEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
