pub mod config;
pub mod discoverer;
pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod signals;
pub mod sink;
pub mod test_utils;
