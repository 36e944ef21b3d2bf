//! # Feed
//!
//! The upstream source of items. `ItemFeed` is the capability the pipeline consumes,
//! `HttpFeed` implements it against a firebase-style JSON API.
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use thiserror::Error;

use crate::item::{Item, ItemId, ItemLookup, ItemParseError};

pub const DEFAULT_FEED_URL: &str = "https://hacker-news.firebaseio.com/v0";

/// Enumeration of errors that can occur while talking to the feed.
/// None of these mean the item does not exist: callers decide whether to try again.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("request to the feed failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed responded with status {0}")]
    Status(StatusCode),
    #[error("could not understand feed response: {0}")]
    Parse(String),
    #[error("invalid feed url: {0}")]
    Url(#[from] url::ParseError),
}

impl FeedError {
    /// A short, low cardinality name for use as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::Request(error) if error.is_timeout() => "timeout",
            FeedError::Request(_) => "request",
            FeedError::Status(_) => "status",
            FeedError::Parse(_) => "parse",
            FeedError::Url(_) => "url",
        }
    }
}

impl From<ItemParseError> for FeedError {
    fn from(error: ItemParseError) -> Self {
        FeedError::Parse(error.to_string())
    }
}

#[async_trait]
pub trait ItemFeed: Send + Sync {
    /// The highest item ID the feed currently knows about.
    async fn max_item_id(&self) -> Result<ItemId, FeedError>;

    /// Look up a single item by ID.
    async fn item(&self, id: ItemId) -> Result<ItemLookup, FeedError>;
}

/// An `ItemFeed` reading `maxitem.json` and `item/{id}.json` over HTTP.
pub struct HttpFeed {
    base_url: url::Url,
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, FeedError> {
        // Url::join drops the last path segment unless it ends with a slash.
        let base_url = if base_url.ends_with('/') {
            url::Url::parse(base_url)?
        } else {
            url::Url::parse(&format!("{base_url}/"))?
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Feed Mirror Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { base_url, client })
    }

    async fn get_text(&self, path: &str) -> Result<String, FeedError> {
        let url = self.base_url.join(path)?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl ItemFeed for HttpFeed {
    async fn max_item_id(&self) -> Result<ItemId, FeedError> {
        let body = self.get_text("maxitem.json").await?;
        parse_max_item_id(&body)
    }

    async fn item(&self, id: ItemId) -> Result<ItemLookup, FeedError> {
        let body = self.get_text(&format!("item/{id}.json")).await?;
        parse_item(id, body)
    }
}

fn parse_max_item_id(body: &str) -> Result<ItemId, FeedError> {
    body.trim()
        .parse::<u64>()
        .map(ItemId)
        .map_err(|_| FeedError::Parse(format!("{body:?} is not a valid item id")))
}

fn parse_item(id: ItemId, body: String) -> Result<ItemLookup, FeedError> {
    if body.trim() == "null" {
        return Ok(ItemLookup::NotAvailable);
    }

    Ok(ItemLookup::Available(Item::from_raw_for(id, body)?))
}
