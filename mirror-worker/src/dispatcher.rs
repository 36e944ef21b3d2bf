use std::sync::Arc;
use std::time;

use mirror_common::item::ItemId;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::fetcher::ItemFetcher;
use crate::sink::ItemSink;

/// Consumes discovered IDs and runs one fetch-then-store unit of work per ID.
///
/// Units of work run concurrently up to `max_concurrent_items`. Once that many are in
/// flight the dispatcher stops receiving, the ingestion channel fills up and discovery
/// blocks. Completion order across IDs is not the discovery order.
pub struct Dispatcher {
    fetcher: Arc<ItemFetcher>,
    sink: Arc<ItemSink>,
    /// Maximum number of units of work in flight.
    max_concurrent_items: u32,
    semaphore: Arc<Semaphore>,
    /// How long to wait for in-flight units of work once shutdown is requested.
    shutdown_timeout: time::Duration,
}

impl Dispatcher {
    pub fn new(
        fetcher: Arc<ItemFetcher>,
        sink: Arc<ItemSink>,
        max_concurrent_items: usize,
        shutdown_timeout: time::Duration,
    ) -> Self {
        let max_concurrent_items = u32::try_from(max_concurrent_items.max(1)).unwrap_or(u32::MAX);

        Self {
            fetcher,
            sink,
            max_concurrent_items,
            semaphore: Arc::new(Semaphore::new(max_concurrent_items as usize)),
            shutdown_timeout,
        }
    }

    /// Run until `shutdown` is cancelled or every sender of the channel is gone, then
    /// wait for in-flight units of work.
    pub async fn run(&self, mut receiver: mpsc::Receiver<ItemId>, shutdown: CancellationToken) {
        let report_semaphore_utilization = || {
            metrics::gauge!("mirror_dispatcher_saturation_percent").set(
                1f64 - self.semaphore.available_permits() as f64
                    / f64::from(self.max_concurrent_items),
            );
        };

        loop {
            report_semaphore_utilization();

            let id = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                id = receiver.recv() => match id {
                    Some(id) => id,
                    None => {
                        info!("ingestion channel closed");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    metrics::counter!("mirror_items_abandoned_total").increment(1);
                    warn!(item_id = %id, "abandoning item on shutdown before dispatch");
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            spawn_item_processing_task(
                self.fetcher.clone(),
                self.sink.clone(),
                permit,
                id,
                shutdown.clone(),
            );
        }

        abandon_buffered(&mut receiver);
        self.wait_for_in_flight().await;
    }

    /// Wait until every permit is back, that is until no unit of work is running.
    async fn wait_for_in_flight(&self) {
        let in_flight = self.max_concurrent_items as usize - self.semaphore.available_permits();
        info!(in_flight, "waiting for in-flight items");

        match tokio::time::timeout(
            self.shutdown_timeout,
            self.semaphore.acquire_many(self.max_concurrent_items),
        )
        .await
        {
            Ok(_) => info!("all in-flight items finished"),
            Err(_) => warn!(
                in_flight = self.max_concurrent_items as usize - self.semaphore.available_permits(),
                "timed out waiting for in-flight items"
            ),
        }
    }
}

/// Close the channel and count every ID still buffered in it as abandoned.
fn abandon_buffered(receiver: &mut mpsc::Receiver<ItemId>) -> usize {
    receiver.close();

    let mut abandoned = 0;
    while let Ok(id) = receiver.try_recv() {
        debug!(item_id = %id, "abandoning buffered item on shutdown");
        abandoned += 1;
    }

    if abandoned > 0 {
        metrics::counter!("mirror_items_abandoned_total").increment(abandoned as u64);
        warn!(abandoned, "abandoning buffered items on shutdown");
    }
    abandoned
}

/// Spawn a Tokio task to fetch and store one item, holding `permit` until it is done.
fn spawn_item_processing_task(
    fetcher: Arc<ItemFetcher>,
    sink: Arc<ItemSink>,
    permit: OwnedSemaphorePermit,
    id: ItemId,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        process_item(&fetcher, &sink, id, &shutdown).await;
        drop(permit);
    });
}

/// Fetch an item and store it. Nothing is returned: a failed write is logged and
/// counted, and the item is not retried.
async fn process_item(
    fetcher: &ItemFetcher,
    sink: &ItemSink,
    id: ItemId,
    shutdown: &CancellationToken,
) {
    let start = tokio::time::Instant::now();

    let item = match fetcher.fetch(id, shutdown).await {
        Ok(item) => item,
        Err(FetchError::Cancelled) => {
            metrics::counter!("mirror_items_abandoned_total").increment(1);
            warn!(item_id = %id, "abandoning item on shutdown before it was fetched");
            return;
        }
    };

    match sink.store(&item).await {
        Ok(()) => {
            metrics::counter!("mirror_items_stored_total").increment(1);
            metrics::histogram!("mirror_item_processing_duration_seconds")
                .record(start.elapsed().as_secs_f64());
            debug!(item_id = %id, "stored item");
        }
        Err(error) => {
            metrics::counter!("mirror_items_store_failed_total", "reason" => error.kind())
                .increment(1);
            error!(item_id = %id, %error, "failed to store item");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryStorage, ScriptedFeed};
    use mirror_common::retry::RetryPolicy;
    use mirror_common::storage::Storage;

    async fn dispatcher(
        feed: Arc<ScriptedFeed>,
        storage: Arc<MemoryStorage>,
        max_concurrent_items: usize,
    ) -> Dispatcher {
        storage.setup().await.expect("setup failed");
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(1)).provide();
        let fetcher = Arc::new(ItemFetcher::new(feed, retry_policy));
        let sink = Arc::new(ItemSink::new(storage));

        Dispatcher::new(
            fetcher,
            sink,
            max_concurrent_items,
            time::Duration::from_secs(30),
        )
    }

    fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<ItemId> {
        range.map(ItemId).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_received_id_is_stored() {
        let feed = Arc::new(ScriptedFeed::new(vec![]));
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = dispatcher(feed, storage.clone(), 4).await;
        let (sender, receiver) = mpsc::channel(100);

        for id in ids(1..=20) {
            sender.send(id).await.unwrap();
        }
        drop(sender);

        dispatcher.run(receiver, CancellationToken::new()).await;

        assert_eq!(storage.stored_ids(), ids(1..=20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_does_not_affect_other_items() {
        let feed = Arc::new(ScriptedFeed::new(vec![]));
        let storage = Arc::new(MemoryStorage::new().failing_for(ItemId(3)));
        let dispatcher = dispatcher(feed, storage.clone(), 10).await;
        let (sender, receiver) = mpsc::channel(100);

        for id in ids(1..=5) {
            sender.send(id).await.unwrap();
        }
        drop(sender);

        dispatcher.run(receiver, CancellationToken::new()).await;

        assert_eq!(
            storage.stored_ids(),
            vec![ItemId(1), ItemId(2), ItemId(4), ItemId(5)]
        );
        // Attempted once and dropped, never retried.
        assert_eq!(
            storage
                .attempts()
                .iter()
                .filter(|id| **id == ItemId(3))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order_follows_fetch_latency() {
        let feed = Arc::new(
            ScriptedFeed::new(vec![])
                .delayed(ItemId(1), time::Duration::from_secs(2))
                .not_available_for(ItemId(2), 1),
        );
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = dispatcher(feed, storage.clone(), 10).await;
        let (sender, receiver) = mpsc::channel(100);

        for id in ids(1..=3) {
            sender.send(id).await.unwrap();
        }
        drop(sender);

        dispatcher.run(receiver, CancellationToken::new()).await;

        // 3 is available at once, 2 after one retry interval, 1 after its delay.
        assert_eq!(
            storage.write_order(),
            vec![ItemId(3), ItemId(2), ItemId(1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_capped() {
        let mut feed = ScriptedFeed::new(vec![]);
        for id in ids(1..=4) {
            feed = feed.delayed(id, time::Duration::from_secs(1));
        }
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = dispatcher(Arc::new(feed), storage.clone(), 2).await;
        let (sender, receiver) = mpsc::channel(100);

        for id in ids(1..=4) {
            sender.send(id).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(receiver, shutdown).await }
        });

        tokio::time::sleep(time::Duration::from_millis(1500)).await;
        assert_eq!(storage.stored_ids(), ids(1..=2));

        tokio::time::sleep(time::Duration::from_secs(1)).await;
        assert_eq!(storage.stored_ids(), ids(1..=4));

        drop(sender);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_backs_up_the_channel() {
        let feed = Arc::new(ScriptedFeed::new(vec![]).not_available_for(ItemId(1), usize::MAX));
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = dispatcher(feed, storage.clone(), 1).await;
        let (sender, receiver) = mpsc::channel(2);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(receiver, shutdown).await }
        });

        for id in ids(1..=3) {
            sender.send(id).await.unwrap();
        }
        tokio::time::sleep(time::Duration::from_secs(5)).await;

        // 1 is in flight and 2 waits for a permit, so only 3 sits in the channel
        // and just one more ID fits.
        assert!(sender.try_send(ItemId(4)).is_ok());
        assert!(matches!(
            sender.try_send(ItemId(5)),
            Err(mpsc::error::TrySendError::Full(_))
        ));

        shutdown.cancel();
        task.await.unwrap();

        assert!(storage.stored_ids().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_ids_are_counted_as_abandoned() {
        let (sender, mut receiver) = mpsc::channel(10);
        for id in ids(1..=3) {
            sender.send(id).await.unwrap();
        }

        assert_eq!(abandon_buffered(&mut receiver), 3);
        assert!(receiver.try_recv().is_err());
        assert!(matches!(
            sender.try_send(ItemId(4)),
            Err(mpsc::error::TrySendError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_nothing_abandoned_from_an_empty_channel() {
        let (sender, mut receiver) = mpsc::channel::<ItemId>(10);
        drop(sender);

        assert_eq!(abandon_buffered(&mut receiver), 0);
    }
}
