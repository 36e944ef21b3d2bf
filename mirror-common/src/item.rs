use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Identifier assigned by the feed to every item, increasing over time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(pub u64);

impl ItemId {
    pub fn next(self) -> ItemId {
        ItemId(self.0 + 1)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        ItemId(id)
    }
}

#[derive(Error, Debug)]
pub enum ItemParseError {
    #[error("item payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected item {expected} but the feed returned item {found}")]
    UnexpectedId { expected: ItemId, found: ItemId },
}

/// The fields we read out of a payload. Everything else stays in the raw text.
#[derive(Deserialize)]
struct ItemHeader {
    id: u64,
    by: Option<String>,
    time: Option<i64>,
}

/// An item as served by the feed.
///
/// The pipeline treats the payload as opaque: `raw` is what gets stored, the
/// parsed header fields exist for logging and for in-memory storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub author: Option<String>,
    pub time: Option<i64>,
    raw: String,
}

impl Item {
    /// Parse an item from the text body returned by the feed.
    pub fn from_raw(raw: String) -> Result<Self, ItemParseError> {
        let header: ItemHeader = serde_json::from_str(&raw)?;

        Ok(Self {
            id: ItemId(header.id),
            author: header.by,
            time: header.time,
            raw,
        })
    }

    /// Parse an item and check it is the one we asked the feed for.
    pub fn from_raw_for(expected: ItemId, raw: String) -> Result<Self, ItemParseError> {
        let item = Self::from_raw(raw)?;
        if item.id != expected {
            return Err(ItemParseError::UnexpectedId {
                expected,
                found: item.id,
            });
        }
        Ok(item)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Result of looking up an item on the feed.
///
/// The feed can publish a new maximum ID before the item behind it is readable,
/// in which case the lookup answers `NotAvailable` rather than failing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemLookup {
    Available(Item),
    NotAvailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_header_fields_and_keeps_raw_payload() {
        let raw = r#"{"by":"pg","id":8863,"kids":[8952],"time":1175714200,"type":"story"}"#;
        let item = Item::from_raw(raw.to_owned()).expect("failed to parse item");

        assert_eq!(item.id, ItemId(8863));
        assert_eq!(item.author.as_deref(), Some("pg"));
        assert_eq!(item.time, Some(1175714200));
        assert_eq!(item.raw(), raw);
    }

    #[test]
    fn test_author_and_time_are_optional() {
        let item = Item::from_raw(r#"{"id":1,"deleted":true}"#.to_owned()).unwrap();

        assert_eq!(item.id, ItemId(1));
        assert_eq!(item.author, None);
        assert_eq!(item.time, None);
    }

    #[test]
    fn test_rejects_payload_without_id() {
        let result = Item::from_raw(r#"{"by":"pg"}"#.to_owned());
        assert!(matches!(result, Err(ItemParseError::InvalidJson(_))));
    }

    #[test]
    fn test_rejects_item_for_another_id() {
        let result = Item::from_raw_for(ItemId(2), r#"{"id":3}"#.to_owned());
        assert!(matches!(
            result,
            Err(ItemParseError::UnexpectedId {
                expected: ItemId(2),
                found: ItemId(3)
            })
        ));
    }

    #[test]
    fn test_next_id() {
        assert_eq!(ItemId(41).next(), ItemId(42));
    }
}
