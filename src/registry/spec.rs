use crate::shared::ids::{ArgumentName, CommandName};
use crate::value::ArgumentValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    String,
    Integer,
    Image,
}

impl PortType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Integer => "Integer",
            Self::Image => "Image",
        }
    }
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegerBounds {
    pub min: i64,
    pub max: i64,
}

impl IntegerBounds {
    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }
}

/// One declared input port of a workflow, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub argument_name: ArgumentName,
    pub port_type: PortType,
    pub required: bool,
    pub default: Option<ArgumentValue>,
    pub bounds: Option<IntegerBounds>,
    /// Node variable in the workflow source that owns this port.
    pub node_id: String,
}

impl PortSpec {
    pub fn name(&self) -> &str {
        self.argument_name.as_str()
    }

    /// Short prompt asked when this port is collected interactively.
    pub fn prompt_label(&self) -> String {
        match (self.port_type, self.bounds) {
            (PortType::Integer, Some(bounds)) => format!(
                "{} `{}` ({}..{})?",
                self.port_type, self.argument_name, bounds.min, bounds.max
            ),
            _ => format!("{} `{}`?", self.port_type, self.argument_name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    Image,
}

/// Result of compiling one workflow source; immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: CommandName,
    pub ports: Vec<PortSpec>,
    pub outputs: Vec<OutputKind>,
}

/// Engine-facing handle of a compiled workflow. Opaque to the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableHandle {
    pub command_name: CommandName,
    pub source_path: PathBuf,
    /// sha256 of the workflow source; identifies the graph for node caching.
    pub source_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub definition: WorkflowDefinition,
    pub display_name: String,
    pub hidden: bool,
    pub executable: ExecutableHandle,
}

impl CommandSpec {
    pub fn name(&self) -> &str {
        self.definition.name.as_str()
    }

    pub fn ports(&self) -> &[PortSpec] {
        &self.definition.ports
    }

    pub fn port(&self, argument_name: &str) -> Option<&PortSpec> {
        self.definition
            .ports
            .iter()
            .find(|port| port.name() == argument_name)
    }

    pub fn required_ports(&self) -> impl Iterator<Item = &PortSpec> {
        self.definition.ports.iter().filter(|port| port.required)
    }

    pub fn accepts_image(&self) -> bool {
        self.definition
            .ports
            .iter()
            .any(|port| port.port_type == PortType::Image)
    }

    /// One-line usage string, e.g. `/upscale <prompt> [--scale 1..4]`.
    pub fn usage(&self) -> String {
        let mut parts = vec![format!("/{}", self.name())];
        for port in self.ports() {
            let rendered = match (port.port_type, port.bounds) {
                (PortType::Image, _) => format!("<{} image>", port.argument_name),
                (PortType::Integer, Some(bounds)) => {
                    format!("--{} {}..{}", port.argument_name, bounds.min, bounds.max)
                }
                _ => format!("--{} <{}>", port.argument_name, port.port_type),
            };
            if port.required {
                parts.push(rendered);
            } else {
                parts.push(format!("[{rendered}]"));
            }
        }
        parts.join(" ")
    }
}

pub type CommandTable = BTreeMap<String, Arc<CommandSpec>>;
