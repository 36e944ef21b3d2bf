use std::sync::Arc;
use std::time;

use mirror_common::feed::ItemFeed;
use mirror_common::health::HealthHandle;
use mirror_common::item::ItemId;
use mirror_common::retry::RetryPolicy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;

/// The lowest ID not yet handed to the dispatcher.
///
/// Starts at the feed's maximum when the process starts, so nothing published before
/// then is ever ingested, and only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark(ItemId);

impl Watermark {
    pub fn new(initial: ItemId) -> Self {
        Watermark(initial)
    }

    pub fn get(&self) -> ItemId {
        self.0
    }

    /// IDs discovered by a poll that reported `max`: from the watermark up to, but
    /// excluding, `max`. Empty if `max` is not above the watermark.
    pub fn pending(&self, max: ItemId) -> impl Iterator<Item = ItemId> {
        (self.0 .0..max.0).map(ItemId)
    }

    /// Record that `id` has been emitted.
    pub fn advance_past(&mut self, id: ItemId) {
        if id >= self.0 {
            self.0 = id.next();
        }
    }
}

/// Polls the feed's maximum ID and emits every newly published ID, once and in
/// increasing order, onto the ingestion channel.
///
/// The channel is bounded: when the dispatcher falls behind, `send` blocks and discovery
/// stops polling until there is room again.
pub struct IdDiscoverer {
    feed: Arc<dyn ItemFeed>,
    poll_interval: time::Duration,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl IdDiscoverer {
    pub fn new(
        feed: Arc<dyn ItemFeed>,
        poll_interval: time::Duration,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            feed,
            poll_interval,
            retry_policy,
            liveness,
        }
    }

    /// Run until `shutdown` is cancelled or the receiving end of `sender` is dropped.
    pub async fn run(
        &self,
        sender: mpsc::Sender<ItemId>,
        shutdown: CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let Some(initial) = self.read_initial_max(&shutdown).await else {
            return Err(DiscoveryError::CancelledBeforeStart);
        };

        let mut watermark = Watermark::new(initial);
        metrics::gauge!("mirror_watermark").set(watermark.get().0 as f64);
        info!(watermark = %initial, "starting discovery from the current maximum item id");

        loop {
            self.liveness.report_healthy();

            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.feed.max_item_id() => polled,
            };

            match polled {
                Ok(max) => {
                    let before = watermark.get();

                    for id in watermark.pending(max) {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => return Ok(()),
                            sent = sender.send(id) => {
                                sent.map_err(|_| DiscoveryError::ChannelClosed)?
                            }
                        }
                        watermark.advance_past(id);
                        metrics::counter!("mirror_items_discovered_total").increment(1);
                        // A slow but moving backlog is progress, not a stall.
                        self.liveness.report_healthy();
                    }

                    metrics::gauge!("mirror_watermark").set(watermark.get().0 as f64);
                    debug!(
                        max = %max,
                        discovered = watermark.get().0 - before.0,
                        watermark = %watermark.get(),
                        "discovery poll complete"
                    );
                }
                Err(error) => {
                    // The watermark is left alone: the next successful poll picks up
                    // everything published in the meantime.
                    metrics::counter!("mirror_discovery_poll_failures_total", "reason" => error.kind())
                        .increment(1);
                    warn!(%error, watermark = %watermark.get(), "failed to poll maximum item id");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(watermark = %watermark.get(), "discovery stopped");
        Ok(())
    }

    /// Read the starting watermark, retrying with backoff. `None` if cancelled first.
    async fn read_initial_max(&self, shutdown: &CancellationToken) -> Option<ItemId> {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);

            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                polled = self.feed.max_item_id() => polled,
            };

            match polled {
                Ok(max) => return Some(max),
                Err(error) => {
                    metrics::counter!("mirror_discovery_poll_failures_total", "reason" => error.kind())
                        .increment(1);
                    warn!(%error, attempt, "failed to read initial maximum item id");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_policy.retry_interval(attempt)) => {}
            }
        }
    }
}
