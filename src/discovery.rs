//! Membership discovery and the ring refresh task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::ring::HashRing;

/// Contract to an external discovery backend.
///
/// Implementations must return addresses reachable by the forwarder. Real
/// backends (DNS, a cluster store) live outside this crate; the in-crate
/// [`StaticDiscovery`] serves fixed-topology deployments and tests.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// The currently-healthy member list of the named service.
    async fn healthy_members(&self, service: &str) -> Result<Vec<String>, PipelineError>;
}

/// Discovery over a fixed address list from configuration.
pub struct StaticDiscovery {
    members: Vec<String>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new(members: Vec<String>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn healthy_members(&self, _service: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self.members.clone())
    }
}

/// One reconciliation pass: query the backend and rebuild the ring when the
/// member set changed. A backend error leaves the previous snapshot intact.
pub async fn refresh_once(discovery: &dyn Discovery, ring: &HashRing, service: &str) {
    match discovery.healthy_members(service).await {
        Ok(mut members) => {
            members.sort_unstable();
            members.dedup();
            if members == ring.members() {
                debug!("membership unchanged ({} members)", members.len());
            } else if ring.set_members(members) {
                info!("membership updated: {:?}", ring.members());
            }
        }
        Err(err) => {
            warn!("discovery backend error, keeping previous membership: {err}");
        }
    }
}

/// Spawns the periodic refresh task.
///
/// The caller is expected to have run [`refresh_once`] synchronously before
/// accepting traffic; the task's first tick fires a full interval later.
pub fn spawn_watcher(
    discovery: Arc<dyn Discovery>,
    ring: Arc<HashRing>,
    service: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval's first tick is immediate and the startup refresh
        // already ran; consume it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            refresh_once(discovery.as_ref(), &ring, &service).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted backend replaying a fixed sequence of responses.
    struct ScriptedDiscovery {
        responses: Mutex<Vec<Result<Vec<String>, PipelineError>>>,
    }

    #[async_trait]
    impl Discovery for ScriptedDiscovery {
        async fn healthy_members(&self, _service: &str) -> Result<Vec<String>, PipelineError> {
            let mut responses = self.responses.lock().expect("poisoned");
            if responses.is_empty() {
                Ok(vec![])
            } else {
                responses.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn test_membership_scenarios() {
        let discovery = ScriptedDiscovery {
            responses: Mutex::new(vec![
                Ok(vec!["X:8000".to_string()]),
                Ok(vec!["X:8000".to_string(), "Y:8000".to_string()]),
                Ok(vec![]),
                Ok(vec!["X:8000".to_string()]),
                Err(PipelineError::from("backend down")),
            ]),
        };
        let ring = HashRing::default();

        refresh_once(&discovery, &ring, "samovar-global").await;
        assert_eq!(ring.members(), vec!["X:8000".to_string()]);
        assert_eq!(ring.lookup("k").as_deref(), Some("X:8000"));

        refresh_once(&discovery, &ring, "samovar-global").await;
        assert_eq!(
            ring.members(),
            vec!["X:8000".to_string(), "Y:8000".to_string()]
        );

        // An empty response keeps the previous non-empty membership.
        refresh_once(&discovery, &ring, "samovar-global").await;
        assert_eq!(
            ring.members(),
            vec!["X:8000".to_string(), "Y:8000".to_string()]
        );

        // The next non-empty response replaces it.
        refresh_once(&discovery, &ring, "samovar-global").await;
        assert_eq!(ring.members(), vec!["X:8000".to_string()]);

        // A backend error leaves the snapshot intact.
        refresh_once(&discovery, &ring, "samovar-global").await;
        assert_eq!(ring.members(), vec!["X:8000".to_string()]);
    }
}
