//! Configuration loading, parsing, validation, and watching.

mod loader;
mod types;
mod validation;
mod watcher;

pub use loader::{ConfigError, expand_env, load_config, save_config};
pub use types::*;
pub use validation::{is_valid_label_name, is_valid_metric_name, validate_config};
pub use watcher::ConfigWatcher;
