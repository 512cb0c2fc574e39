mod raw;

pub mod error;
pub mod loader;
pub mod settings;

pub use error::ConfigError;
pub use loader::{from_yaml_str, load_config};
pub use settings::{Config, Mode, QueueSettings};
