use crate::app::command_support::{load_registry, load_settings};
use crate::registry::CommandSpec;
use std::path::PathBuf;

pub fn cmd_workflows(config: Option<PathBuf>, args: &[String]) -> Result<String, String> {
    if args.is_empty() {
        return Err("usage: workflows <list|show> ...".to_string());
    }

    match args[0].as_str() {
        "list" => {
            if args.len() != 1 {
                return Err("usage: workflows list".to_string());
            }
            let loaded = load_settings(config)?;
            let (_, report) = load_registry(&loaded)?;
            if report.commands.is_empty() {
                return Ok(format!(
                    "no workflows in {}",
                    loaded.workflows_dir().display()
                ));
            }
            Ok(report
                .commands
                .values()
                .map(|command| {
                    let hidden = if command.hidden { " (hidden)" } else { "" };
                    format!("{}{hidden}\n  {}", command.usage(), command.display_name)
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        "show" => {
            if args.len() != 2 {
                return Err("usage: workflows show <command>".to_string());
            }
            let loaded = load_settings(config)?;
            let (registry, _) = load_registry(&loaded)?;
            let name = args[1].trim_start_matches('/');
            let command = registry
                .lookup(name)
                .ok_or_else(|| format!("unknown command `{name}`"))?;
            Ok(describe_command(&command))
        }
        other => Err(format!("unknown workflows subcommand `{other}`")),
    }
}

/// Compiles every workflow; fails when any was skipped.
pub fn cmd_check(config: Option<PathBuf>) -> Result<String, String> {
    let loaded = load_settings(config)?;
    let (_, report) = load_registry(&loaded)?;
    let mut lines = vec![format!(
        "workflows_dir={}",
        loaded.workflows_dir().display()
    )];
    lines.push(format!("commands={}", report.commands.len()));
    if report.skipped.is_empty() {
        lines.push("ok".to_string());
        return Ok(lines.join("\n"));
    }
    lines.push(format!("skipped={}", report.skipped.len()));
    lines.extend(report.skipped.iter().map(|err| format!("  {err}")));
    Err(lines.join("\n"))
}

fn describe_command(command: &CommandSpec) -> String {
    let mut lines = vec![
        format!("command: /{}", command.name()),
        format!("name: {}", command.display_name),
        format!("hidden: {}", command.hidden),
        format!("source: {}", command.executable.source_path.display()),
        format!("usage: {}", command.usage()),
        "ports:".to_string(),
    ];
    for port in command.ports() {
        let mut line = format!(
            "  --{} {}{}",
            port.argument_name,
            port.port_type,
            if port.required { " required" } else { "" }
        );
        if let Some(bounds) = port.bounds {
            line.push_str(&format!(" range={}..{}", bounds.min, bounds.max));
        }
        if let Some(default) = &port.default {
            line.push_str(&format!(" default={}", default.display()));
        }
        lines.push(line);
    }
    lines.join("\n")
}
