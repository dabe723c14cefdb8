pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{
    EXAMPLE_SETTINGS, default_config_path, default_log_path, load_config,
    load_config_or_write_example, load_config_unchecked, write_example_config,
};
pub use models::*;
pub use validation::{ServerConfigValidator, ValidationError, ValidationResult};
