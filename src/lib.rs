#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod kv_handler;
pub mod kv_store;
pub mod logging;
pub mod worker;

pub use cache::{CacheHandle, Command, Supervisor, Value};
pub use config::Config;
pub use error::{CacheError, Result};
pub use kv_store::{Connector, KeyValueStore, MemoryStore};

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
