//! Forwarder client: ships one flush cycle's partials upstream.
//!
//! Each destination gets the whole cycle as a single client-streaming RPC;
//! the stream is opened and closed within the cycle so a stalled peer can
//! never delay the next one. Transport channels are cached per destination
//! and discarded on the first error. Failures drop the batch for this
//! cycle and count it: later cycles carry fresh data, and retrying would
//! double-count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::rpc::pb::{forward_client::ForwardClient, FlushAck, PartialSketch};
use crate::stats::PipelineStats;

/// Per-cycle batches keyed by destination address.
pub type CycleBatches = HashMap<String, Vec<PartialSketch>>;

pub struct Forwarder {
    clients: Mutex<HashMap<String, ForwardClient<Channel>>>,
    stats: Arc<PipelineStats>,
    /// Budget for one whole cycle; `interval − 1s`, floored at one second.
    cycle_timeout: Duration,
}

impl Forwarder {
    #[must_use]
    pub fn new(stats: Arc<PipelineStats>, interval: Duration) -> Self {
        let cycle_timeout = interval
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        Self {
            clients: Mutex::new(HashMap::new()),
            stats,
            cycle_timeout,
        }
    }

    /// Ships every destination's batch concurrently and waits for the
    /// cycle to settle (ack, error, or timeout per destination).
    pub async fn forward_cycle(&self, batches: CycleBatches) {
        let sends = batches
            .into_iter()
            .map(|(destination, batch)| self.send_batch(destination, batch));
        futures_util::future::join_all(sends).await;
    }

    async fn send_batch(&self, destination: String, batch: Vec<PartialSketch>) {
        let len = batch.len() as u64;
        match tokio::time::timeout(self.cycle_timeout, self.try_send(&destination, batch)).await {
            Ok(Ok(ack)) => {
                debug!(
                    "forwarded {len} partials to {destination}, {} accepted",
                    ack.accepted
                );
            }
            Ok(Err(err)) => {
                warn!("forward to {destination} failed, dropping {len} partials: {err}");
                self.stats.add_forward_dropped(len);
                self.clients.lock().await.remove(&destination);
            }
            Err(_) => {
                warn!("forward to {destination} timed out, dropping {len} partials");
                self.stats.add_forward_dropped(len);
                self.clients.lock().await.remove(&destination);
            }
        }
    }

    async fn try_send(
        &self,
        destination: &str,
        batch: Vec<PartialSketch>,
    ) -> Result<FlushAck, PipelineError> {
        let mut client = self.client_for(destination).await?;
        let response = client
            .forward(tonic::Request::new(tokio_stream::iter(batch)))
            .await?;
        Ok(response.into_inner())
    }

    async fn client_for(&self, destination: &str) -> Result<ForwardClient<Channel>, PipelineError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(destination) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(endpoint_uri(destination))?
            .connect()
            .await?;
        let client = ForwardClient::new(channel);
        clients.insert(destination.to_string(), client.clone());
        Ok(client)
    }
}

/// Discovery hands out bare `host:port` addresses; tonic wants a URI.
pub(crate) fn endpoint_uri(destination: &str) -> String {
    if destination.starts_with("http://") || destination.starts_with("https://") {
        destination.to_string()
    } else {
        format!("http://{destination}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uri_normalization() {
        assert_eq!(endpoint_uri("127.0.0.1:8128"), "http://127.0.0.1:8128");
        assert_eq!(endpoint_uri("http://x:1"), "http://x:1");
        assert_eq!(endpoint_uri("https://x:1"), "https://x:1");
    }

    #[tokio::test]
    async fn test_unreachable_destination_drops_and_counts() {
        let stats = Arc::new(PipelineStats::default());
        let forwarder = Forwarder::new(stats.clone(), Duration::from_secs(2));

        let mut batches = CycleBatches::new();
        batches.insert(
            // Reserved port that nothing listens on.
            "127.0.0.1:9".to_string(),
            vec![PartialSketch::default(), PartialSketch::default()],
        );
        forwarder.forward_cycle(batches).await;

        assert_eq!(
            stats
                .forward_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }
}
