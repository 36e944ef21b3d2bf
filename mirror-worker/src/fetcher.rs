use std::sync::Arc;

use mirror_common::feed::ItemFeed;
use mirror_common::item::{Item, ItemId, ItemLookup};
use mirror_common::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Retrieves items from the feed, waiting for them to become available.
///
/// An ID can be discovered through the feed's maximum before the item behind it is
/// readable. The fetcher keeps asking, with backoff, until the item shows up: there is
/// no attempt limit, so an item that never appears keeps its unit of work alive until
/// shutdown. Transient feed errors are retried the same way but logged separately.
pub struct ItemFetcher {
    feed: Arc<dyn ItemFeed>,
    retry_policy: RetryPolicy,
}

impl ItemFetcher {
    pub fn new(feed: Arc<dyn ItemFeed>, retry_policy: RetryPolicy) -> Self {
        Self { feed, retry_policy }
    }

    /// Fetch the item with the given ID, retrying until it is available or `shutdown` fires.
    pub async fn fetch(
        &self,
        id: ItemId,
        shutdown: &CancellationToken,
    ) -> Result<Item, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);

            let lookup = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(FetchError::Cancelled),
                lookup = self.feed.item(id) => lookup,
            };

            match lookup {
                Ok(ItemLookup::Available(item)) => {
                    metrics::counter!("mirror_fetch_attempts_total", "outcome" => "available")
                        .increment(1);
                    debug!(item_id = %id, attempt, "fetched item");
                    return Ok(item);
                }
                Ok(ItemLookup::NotAvailable) => {
                    metrics::counter!("mirror_fetch_attempts_total", "outcome" => "not_available")
                        .increment(1);
                    debug!(item_id = %id, attempt, "item not available yet");
                }
                Err(error) => {
                    metrics::counter!("mirror_fetch_attempts_total", "outcome" => error.kind())
                        .increment(1);
                    warn!(item_id = %id, attempt, %error, "failed to fetch item");
                }
            }

            let wait = self.retry_policy.retry_interval(attempt);
            if wait.is_zero() {
                // Still give the rest of the runtime a chance between attempts.
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{item, ScriptedFeed};
    use std::time;

    fn no_wait() -> RetryPolicy {
        RetryPolicy::build(1, time::Duration::ZERO).provide()
    }

    #[tokio::test]
    async fn test_returns_immediately_available_item() {
        let feed = Arc::new(ScriptedFeed::new(vec![]));
        let fetcher = ItemFetcher::new(feed.clone(), no_wait());

        let fetched = fetcher
            .fetch(ItemId(100), &CancellationToken::new())
            .await
            .expect("fetch failed");

        assert_eq!(fetched, item(100));
        assert_eq!(feed.item_calls(ItemId(100)), 1);
    }

    #[tokio::test]
    async fn test_makes_n_plus_one_calls_when_not_available_n_times() {
        for n in [1, 3, 25] {
            let feed = Arc::new(ScriptedFeed::new(vec![]).not_available_for(ItemId(7), n));
            let fetcher = ItemFetcher::new(feed.clone(), no_wait());

            let fetched = fetcher
                .fetch(ItemId(7), &CancellationToken::new())
                .await
                .expect("fetch failed");

            assert_eq!(fetched, item(7));
            assert_eq!(feed.item_calls(ItemId(7)), n + 1);
        }
    }

    #[tokio::test]
    async fn test_retries_through_feed_errors() {
        let feed = Arc::new(ScriptedFeed::new(vec![]).failing_for(ItemId(9), 2));
        let fetcher = ItemFetcher::new(feed.clone(), no_wait());

        let fetched = fetcher
            .fetch(ItemId(9), &CancellationToken::new())
            .await
            .expect("fetch failed");

        assert_eq!(fetched, item(9));
        assert_eq!(feed.item_calls(ItemId(9)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_between_attempts() {
        let feed = Arc::new(ScriptedFeed::new(vec![]).not_available_for(ItemId(1), 3));
        let policy = RetryPolicy::build(2, time::Duration::from_millis(100))
            .maximum_interval(time::Duration::from_secs(1))
            .provide();
        let fetcher = ItemFetcher::new(feed.clone(), policy);

        let start = tokio::time::Instant::now();
        fetcher
            .fetch(ItemId(1), &CancellationToken::new())
            .await
            .expect("fetch failed");

        // 100ms + 200ms + 400ms of backoff before the fourth call succeeds.
        let elapsed = start.elapsed();
        assert!(elapsed >= time::Duration::from_millis(700));
        assert!(elapsed < time::Duration::from_millis(800));
        assert_eq!(feed.item_calls(ItemId(1)), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_an_item_that_never_appears() {
        let feed = Arc::new(ScriptedFeed::new(vec![]).not_available_for(ItemId(5), usize::MAX));
        let policy = RetryPolicy::build(1, time::Duration::from_millis(50)).provide();
        let fetcher = ItemFetcher::new(feed.clone(), policy);
        let shutdown = CancellationToken::new();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time::Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = fetcher.fetch(ItemId(5), &shutdown).await;

        assert_eq!(result, Err(FetchError::Cancelled));
        assert!(feed.item_calls(ItemId(5)) > 1);
    }
}
