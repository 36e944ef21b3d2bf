use mirror_common::feed::FeedError;
use mirror_common::storage::StorageError;
use thiserror::Error;

/// Enumeration of errors that end an `ItemFetcher` attempt loop.
/// Feed failures are retried, so the only way out without an item is shutdown.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch was cancelled by shutdown")]
    Cancelled,
}

/// Enumeration of reasons the `IdDiscoverer` loop stops.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery was cancelled before the initial maximum id was read")]
    CancelledBeforeStart,
    #[error("ingestion channel was closed by the dispatcher")]
    ChannelClosed,
}

/// Enumeration of errors related to initialization and running of the mirror.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to initialize storage: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to initialize feed client: {0}")]
    Feed(#[from] FeedError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
    #[error("discovery loop stopped: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("{0} task panicked or was aborted")]
    Task(&'static str),
}
