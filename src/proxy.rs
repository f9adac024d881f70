//! Stateless request-level router between local and global aggregators.
//!
//! Each inbound stream captures one ring snapshot and routes every message
//! on it by metric name, so a membership change mid-stream can never split
//! one cycle's partials for a name across two upstreams. Downstream
//! streams are opened lazily per destination and closed when the inbound
//! stream ends. A message for a dead downstream is dropped and counted,
//! never re-routed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::forward::endpoint_uri;
use crate::ring::HashRing;
use crate::rpc::pb::forward_client::ForwardClient;
use crate::rpc::pb::forward_server::Forward;
use crate::rpc::pb::{FlushAck, PartialSketch};
use crate::stats::PipelineStats;

/// Buffered messages per downstream stream.
const DOWNSTREAM_DEPTH: usize = 1024;

pub struct ProxyRouter {
    ring: Arc<HashRing>,
    stats: Arc<PipelineStats>,
}

impl ProxyRouter {
    #[must_use]
    pub fn new(ring: Arc<HashRing>, stats: Arc<PipelineStats>) -> Self {
        Self { ring, stats }
    }
}

struct Downstream {
    tx: mpsc::Sender<PartialSketch>,
    task: JoinHandle<Result<FlushAck, PipelineError>>,
    sent: u64,
}

impl Downstream {
    fn open(destination: String) -> Self {
        let (tx, rx) = mpsc::channel(DOWNSTREAM_DEPTH);
        let task = tokio::spawn(async move {
            let channel = Endpoint::from_shared(endpoint_uri(&destination))?
                .connect()
                .await?;
            let mut client = ForwardClient::new(channel);
            let response = client
                .forward(Request::new(ReceiverStream::new(rx)))
                .await?;
            Ok(response.into_inner())
        });
        Self { tx, task, sent: 0 }
    }
}

#[tonic::async_trait]
impl Forward for ProxyRouter {
    async fn forward(
        &self,
        request: Request<Streaming<PartialSketch>>,
    ) -> Result<Response<FlushAck>, Status> {
        // One snapshot for the whole stream.
        let snapshot = self.ring.snapshot();
        if snapshot.is_empty() {
            return Err(Status::unavailable("no upstream members"));
        }

        let mut inbound = request.into_inner();
        let mut downstreams: HashMap<String, Downstream> = HashMap::new();

        while let Some(message) = inbound.message().await? {
            let Some(destination) = snapshot.lookup(&message.name) else {
                self.stats.add_proxy_dropped(1);
                continue;
            };
            let downstream = downstreams
                .entry(destination.to_string())
                .or_insert_with_key(|dest| Downstream::open(dest.clone()));
            if downstream.tx.send(message).await.is_ok() {
                downstream.sent += 1;
            } else {
                // The downstream task died; its channel is closed.
                self.stats.add_proxy_dropped(1);
            }
        }

        let mut accepted = 0u64;
        for (destination, downstream) in downstreams {
            let Downstream { tx, task, sent } = downstream;
            // Closing the channel ends the downstream stream.
            drop(tx);
            match task.await {
                Ok(Ok(ack)) => {
                    debug!("routed {sent} partials to {destination}, {} accepted", ack.accepted);
                    accepted += sent;
                }
                Ok(Err(err)) => {
                    warn!("downstream {destination} failed, dropping {sent} partials: {err}");
                    self.stats.add_proxy_dropped(sent);
                }
                Err(err) => {
                    warn!("downstream {destination} task panicked: {err}");
                    self.stats.add_proxy_dropped(sent);
                }
            }
        }

        Ok(Response::new(FlushAck { accepted }))
    }
}
