//! In-memory stand-ins for the feed and storage, used by unit and integration tests.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use mirror_common::feed::{FeedError, ItemFeed};
use mirror_common::item::{Item, ItemId, ItemLookup};
use mirror_common::storage::{Storage, StorageError, INSERT_ITEM};

/// Build the item the fake feed serves for an ID.
pub fn item(id: u64) -> Item {
    Item::from_raw(format!(
        r#"{{"by":"user{id}","id":{id},"time":{},"type":"comment"}}"#,
        1_700_000_000 + id
    ))
    .expect("test item is valid JSON")
}

#[derive(Default)]
struct FeedState {
    max_script: VecDeque<Option<u64>>,
    last_max: Option<u64>,
    max_calls: usize,
    item_calls: HashMap<ItemId, usize>,
    not_available: HashMap<ItemId, usize>,
    failing: HashMap<ItemId, usize>,
}

/// A feed whose maximum ID follows a script and whose items are always eventually available.
///
/// Each call to `max_item_id` consumes one scripted entry; `None` entries fail the call.
/// Once the script runs out the last successful maximum is repeated.
#[derive(Default)]
pub struct ScriptedFeed {
    state: Mutex<FeedState>,
    delays: HashMap<ItemId, time::Duration>,
}

impl ScriptedFeed {
    pub fn new(max_ids: Vec<u64>) -> Self {
        Self::with_max_script(max_ids.into_iter().map(Some).collect())
    }

    pub fn with_max_script(script: Vec<Option<u64>>) -> Self {
        Self {
            state: Mutex::new(FeedState {
                max_script: script.into(),
                ..Default::default()
            }),
            delays: HashMap::new(),
        }
    }

    /// Answer `NotAvailable` for the first `times` lookups of `id`.
    pub fn not_available_for(self, id: ItemId, times: usize) -> Self {
        self.state
            .lock()
            .expect("poisoned feed state")
            .not_available
            .insert(id, times);
        self
    }

    /// Fail the first `times` lookups of `id` with a server error.
    pub fn failing_for(self, id: ItemId, times: usize) -> Self {
        self.state
            .lock()
            .expect("poisoned feed state")
            .failing
            .insert(id, times);
        self
    }

    /// Make every lookup of `id` take `delay`.
    pub fn delayed(mut self, id: ItemId, delay: time::Duration) -> Self {
        self.delays.insert(id, delay);
        self
    }

    pub fn max_calls(&self) -> usize {
        self.state.lock().expect("poisoned feed state").max_calls
    }

    pub fn item_calls(&self, id: ItemId) -> usize {
        self.state
            .lock()
            .expect("poisoned feed state")
            .item_calls
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

fn take_one(remaining: &mut HashMap<ItemId, usize>, id: ItemId) -> bool {
    match remaining.get_mut(&id) {
        Some(0) | None => false,
        Some(times) => {
            *times -= 1;
            true
        }
    }
}

#[async_trait]
impl ItemFeed for ScriptedFeed {
    async fn max_item_id(&self) -> Result<ItemId, FeedError> {
        let mut state = self.state.lock().expect("poisoned feed state");
        state.max_calls += 1;

        match state.max_script.pop_front() {
            Some(Some(max)) => {
                state.last_max = Some(max);
                Ok(ItemId(max))
            }
            Some(None) => Err(FeedError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            None => Ok(ItemId(state.last_max.unwrap_or(0))),
        }
    }

    async fn item(&self, id: ItemId) -> Result<ItemLookup, FeedError> {
        if let Some(delay) = self.delays.get(&id) {
            tokio::time::sleep(*delay).await;
        }

        let mut state = self.state.lock().expect("poisoned feed state");
        *state.item_calls.entry(id).or_insert(0) += 1;

        if take_one(&mut state.failing, id) {
            return Err(FeedError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        if take_one(&mut state.not_available, id) {
            return Ok(ItemLookup::NotAvailable);
        }

        Ok(ItemLookup::Available(item(id.0)))
    }
}

#[derive(Default)]
struct StorageState {
    ready: bool,
    rows: BTreeMap<ItemId, Item>,
    write_order: Vec<ItemId>,
    attempts: Vec<ItemId>,
}

/// A storage keeping rows in memory, with the same duplicate semantics as `PgStorage`.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<StorageState>,
    failing: HashSet<ItemId>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write of `id` with a storage error.
    pub fn failing_for(mut self, id: ItemId) -> Self {
        self.failing.insert(id);
        self
    }

    pub fn stored_ids(&self) -> Vec<ItemId> {
        self.state
            .lock()
            .expect("poisoned storage state")
            .rows
            .keys()
            .copied()
            .collect()
    }

    pub fn row(&self, id: ItemId) -> Option<Item> {
        self.state
            .lock()
            .expect("poisoned storage state")
            .rows
            .get(&id)
            .cloned()
    }

    /// IDs in the order their writes succeeded.
    pub fn write_order(&self) -> Vec<ItemId> {
        self.state
            .lock()
            .expect("poisoned storage state")
            .write_order
            .clone()
    }

    /// IDs of every write attempted, successful or not.
    pub fn attempts(&self) -> Vec<ItemId> {
        self.state
            .lock()
            .expect("poisoned storage state")
            .attempts
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn setup(&self) -> Result<(), StorageError> {
        self.state.lock().expect("poisoned storage state").ready = true;
        Ok(())
    }

    async fn execute(&self, statement: &str, item: &Item) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("poisoned storage state");
        state.attempts.push(item.id);

        if !state.ready || statement != INSERT_ITEM {
            return Err(StorageError::UnknownStatement(statement.to_owned()));
        }
        if self.failing.contains(&item.id) {
            return Err(StorageError::Query {
                command: statement.to_owned(),
                error: sqlx::Error::PoolTimedOut,
            });
        }
        if state.rows.contains_key(&item.id) {
            return Err(StorageError::Duplicate { id: item.id });
        }

        state.rows.insert(item.id, item.clone());
        state.write_order.push(item.id);
        Ok(())
    }
}
