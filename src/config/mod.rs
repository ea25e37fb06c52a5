pub mod center;
pub mod loader;
pub mod models;
pub mod validation;
pub mod version;
pub mod watcher;

pub use center::{AdminOpError, ConfigCenter};
pub use loader::load_config;
pub use models::*;
pub use validation::{ConfigValidator, ValidationError, ValidationResult};
pub use version::{ConfigVersion, VersionManager};
pub use watcher::ConfigWatcher;
