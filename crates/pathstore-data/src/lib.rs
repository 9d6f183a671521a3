pub mod config;
pub mod loader;
pub mod open;

pub use config::{BulkConfig, CheckpointConfig, RecordStoreConfig, StoreConfig};
pub use loader::{ConfigError, Format, load_config};
pub use open::{open_context, open_context_with_types};
