#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read workflow directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read workflow source {path}: {source}")]
    ReadSource {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid workflow catalog {path}: {source}")]
    Catalog {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("malformed workflow `{workflow}`: {reason}")]
    MalformedWorkflow { workflow: String, reason: String },
}

impl RegistryError {
    pub(crate) fn malformed(workflow: &str, reason: impl Into<String>) -> Self {
        Self::MalformedWorkflow {
            workflow: workflow.to_string(),
            reason: reason.into(),
        }
    }
}
