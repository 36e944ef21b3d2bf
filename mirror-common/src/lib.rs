pub mod feed;
pub mod health;
pub mod item;
pub mod metrics;
pub mod retry;
pub mod storage;
