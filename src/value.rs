use serde::{Deserialize, Serialize};

use crate::registry::PortType;

/// Transport-side handle of an image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub file_id: String,
}

impl ImageRef {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A collected argument, typed by the port it was collected for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgumentValue {
    Text(String),
    Integer(i64),
    Image(ImageRef),
}

impl ArgumentValue {
    pub fn port_type(&self) -> PortType {
        match self {
            Self::Text(_) => PortType::String,
            Self::Integer(_) => PortType::Integer,
            Self::Image(_) => PortType::Image,
        }
    }

    /// Form rendering; images are shown by presence only.
    pub fn display(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Image(_) => "(image)".to_string(),
        }
    }
}

/// Value handed to the execution engine for one input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundValue {
    Text(String),
    Integer(i64),
    Image(ImageData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputValue {
    Text(String),
    Image(ImageData),
}
