pub mod adapter;
pub mod chat;
pub mod command_line;
pub mod console;
pub mod policy;
pub mod transport;

pub use transport::{ChatKind, InboundMessage, Transport, TransportError};
