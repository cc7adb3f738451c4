use super::{resolve_config_path, ConfigError, Settings};
use std::path::PathBuf;

pub fn load_settings(explicit: Option<PathBuf>) -> Result<Settings, ConfigError> {
    let path = resolve_config_path(explicit)?;
    let settings = Settings::from_path(&path)?;
    settings.validate()?;
    Ok(settings)
}
