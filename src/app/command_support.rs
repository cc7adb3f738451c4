use crate::config::{load_settings as config_load_settings, resolve_config_path, Settings};
use crate::registry::{RefreshReport, WorkflowRegistry};
use std::path::{Path, PathBuf};

pub const CONFIG_FLAG: &str = "--config";

/// Settings plus the directory relative paths in them resolve against.
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub path: PathBuf,
}

impl LoadedSettings {
    pub fn config_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.settings.resolve_workflows_dir(self.config_dir())
    }
}

/// Pulls `--config <path>` out of the argument list, wherever it appears.
pub fn split_config_flag(args: &[String]) -> Result<(Option<PathBuf>, Vec<String>), String> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(value));
        } else if arg == CONFIG_FLAG {
            let value = iter
                .next()
                .ok_or_else(|| "usage: --config <path>".to_string())?;
            config = Some(PathBuf::from(value));
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((config, rest))
}

pub fn load_settings(explicit: Option<PathBuf>) -> Result<LoadedSettings, String> {
    let path = resolve_config_path(explicit).map_err(|e| e.to_string())?;
    let settings = config_load_settings(Some(path.clone())).map_err(|e| e.to_string())?;
    Ok(LoadedSettings { settings, path })
}

pub fn load_registry(loaded: &LoadedSettings) -> Result<(WorkflowRegistry, RefreshReport), String> {
    let registry = WorkflowRegistry::from_dir(loaded.workflows_dir());
    let report = registry.refresh().map_err(|e| e.to_string())?;
    Ok((registry, report))
}
