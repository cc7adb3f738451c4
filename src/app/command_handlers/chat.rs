use crate::app::command_support::load_settings;
use crate::channels::chat::{run_local_chat_stdio, LocalIdentity};
use crate::channels::console::ConsoleTransport;
use crate::runtime::{Runtime, StatePaths};
use std::path::PathBuf;
use std::sync::Arc;

pub fn cmd_chat(config: Option<PathBuf>, args: &[String]) -> Result<String, String> {
    if !args.is_empty() {
        return Err("usage: chat".to_string());
    }

    let loaded = load_settings(config)?;
    let root = loaded
        .settings
        .resolve_state_root()
        .map_err(|e| e.to_string())?;
    let transport = Arc::new(ConsoleTransport::new(
        std::io::stdout(),
        StatePaths::new(root).outbox_dir(),
    ));
    let runtime = Runtime::from_settings(&loaded.settings, loaded.config_dir(), transport)
        .map_err(|e| format!("failed to start runtime: {e}"))?;
    let result = run_local_chat_stdio(runtime.dispatcher(), &LocalIdentity::default());
    runtime.shutdown();
    result
}
