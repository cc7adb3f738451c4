pub mod app;
pub mod channels;
pub mod config;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shared;
pub mod value;
