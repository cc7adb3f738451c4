pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::load_settings;
pub use paths::{
    default_global_config_path, default_state_root, resolve_config_path, CONFIG_PATH_ENV,
    GLOBAL_SETTINGS_FILE_NAME, GLOBAL_STATE_DIR,
};
pub use settings::{
    AccessSettings, CacheSettings, ExecutorSettings, ProgressSettings, SessionSettings, Settings,
};
