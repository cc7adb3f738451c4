//! Workflow registry: compiles workflow sources into the invocable command table.
//!
//! A refresh builds a brand-new [`CommandTable`] and swaps it in whole. Each
//! [`CommandSpec`] is shared through `Arc`, so a session or job holding one
//! from an older table keeps a valid copy until it finishes.

pub mod compiler;
pub mod error;
pub mod scanner;
pub mod source;
pub mod spec;

pub use compiler::{HookScanCompiler, WorkflowCompiler};
pub use error::RegistryError;
pub use source::{DirectoryWorkflowSource, WorkflowCatalog, WorkflowSource, WorkflowSourceFile};
pub use spec::{
    CommandSpec, CommandTable, ExecutableHandle, IntegerBounds, OutputKind, PortSpec, PortType,
    WorkflowDefinition,
};

use crate::shared::ids::hex_encode;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug)]
pub struct RefreshReport {
    pub commands: Arc<CommandTable>,
    /// Workflows left out of this refresh, one error each.
    pub skipped: Vec<RegistryError>,
}

pub struct WorkflowRegistry {
    source: Box<dyn WorkflowSource>,
    compiler: Box<dyn WorkflowCompiler>,
    table: RwLock<Arc<CommandTable>>,
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("commands", &self.table().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkflowRegistry {
    pub fn new(source: Box<dyn WorkflowSource>, compiler: Box<dyn WorkflowCompiler>) -> Self {
        Self {
            source,
            compiler,
            table: RwLock::new(Arc::new(CommandTable::new())),
        }
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(
            Box::new(DirectoryWorkflowSource::new(dir)),
            Box::new(HookScanCompiler),
        )
    }

    /// Recompiles every workflow. A workflow that fails to load or compile is
    /// skipped and reported; only an unreadable source store fails the call.
    pub fn refresh(&self) -> Result<RefreshReport, RegistryError> {
        let catalog = self.source.catalog().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring unreadable workflow catalog");
            WorkflowCatalog::default()
        });

        let mut table = CommandTable::new();
        let mut skipped = Vec::new();
        for loaded in self.source.enumerate()? {
            let compiled = loaded.and_then(|file| {
                let definition = self.compiler.compile(&file)?;
                Ok((file, definition))
            });
            let (file, definition) = match compiled {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping workflow");
                    skipped.push(err);
                    continue;
                }
            };

            let name = definition.name.as_str().to_string();
            let spec = CommandSpec {
                display_name: catalog.display_name(&name),
                hidden: catalog.is_hidden(&name),
                executable: ExecutableHandle {
                    command_name: definition.name.clone(),
                    source_path: file.path.clone(),
                    source_digest: source_digest(&file.text),
                },
                definition,
            };
            tracing::debug!(command = %name, ports = spec.ports().len(), "compiled workflow");
            table.insert(name, Arc::new(spec));
        }

        let commands = Arc::new(table);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = commands.clone();
        tracing::info!(
            commands = commands.len(),
            skipped = skipped.len(),
            "workflow registry refreshed"
        );
        Ok(RefreshReport { commands, skipped })
    }

    /// Current table snapshot.
    pub fn table(&self) -> Arc<CommandTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup(&self, command_name: &str) -> Option<Arc<CommandSpec>> {
        self.table().get(command_name).cloned()
    }
}

fn source_digest(text: &str) -> String {
    hex_encode(&Sha256::digest(text.as_bytes()))
}
