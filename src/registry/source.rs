use super::RegistryError;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const WORKFLOW_EXTENSION: &str = "py";
pub const CATALOG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSourceFile {
    pub name: String,
    pub path: PathBuf,
    pub text: String,
}

/// Presentation metadata kept next to the workflow sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WorkflowCatalog {
    #[serde(default)]
    pub display_names: BTreeMap<String, String>,
    #[serde(default)]
    pub hidden: BTreeSet<String>,
}

impl WorkflowCatalog {
    pub fn display_name(&self, command: &str) -> String {
        self.display_names
            .get(command)
            .cloned()
            .unwrap_or_else(|| command.to_string())
    }

    pub fn is_hidden(&self, command: &str) -> bool {
        self.hidden.contains(command)
    }
}

/// Read-only store of raw workflow definitions.
pub trait WorkflowSource: Send + Sync {
    /// Each entry is either a loaded source or the error that prevented
    /// loading that one file.
    fn enumerate(&self) -> Result<Vec<Result<WorkflowSourceFile, RegistryError>>, RegistryError>;

    fn catalog(&self) -> Result<WorkflowCatalog, RegistryError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryWorkflowSource {
    dir: PathBuf,
}

impl DirectoryWorkflowSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_workflow_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(true);
    !hidden
        && path.is_file()
        && path.extension().and_then(|ext| ext.to_str()) == Some(WORKFLOW_EXTENSION)
}

impl WorkflowSource for DirectoryWorkflowSource {
    fn enumerate(&self) -> Result<Vec<Result<WorkflowSourceFile, RegistryError>>, RegistryError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| RegistryError::ReadDir {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RegistryError::ReadDir {
                path: self.dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if is_workflow_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|path| {
                let name = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or_default()
                    .to_string();
                let text =
                    fs::read_to_string(&path).map_err(|source| RegistryError::ReadSource {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(WorkflowSourceFile { name, path, text })
            })
            .collect())
    }

    fn catalog(&self) -> Result<WorkflowCatalog, RegistryError> {
        let path = self.dir.join(CATALOG_FILE_NAME);
        if !path.is_file() {
            return Ok(WorkflowCatalog::default());
        }
        let raw = fs::read_to_string(&path).map_err(|source| RegistryError::ReadSource {
            path: path.display().to_string(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(WorkflowCatalog::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| RegistryError::Catalog {
            path: path.display().to_string(),
            source,
        })
    }
}
