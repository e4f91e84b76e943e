pub mod app;
pub mod cli;
pub mod config;
pub mod remaining;
pub mod repository;
pub mod search;
pub mod storage;

pub use app::StateProjection;
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use remaining::{calculate_time_remaining, TimeRemaining};
pub use repository::CounterRepository;
pub use storage::{Counter, CounterHistoryEntry, NewCounter, StorageError, StorageHandle};
