use crate::registry::{CommandSpec, PortSpec};
use crate::value::ArgumentValue;
use std::fmt::Write as _;

const FORM_TITLE: &str = "INPUT CHAIN";

/// Renders the in-progress form: values collected so far, then the question
/// for the next port.
pub fn render_prompt(
    command: &CommandSpec,
    collected: &[(String, ArgumentValue)],
    next: &PortSpec,
) -> String {
    let mut out = header(command);
    for (name, value) in collected {
        let _ = writeln!(out, "{name}: {}", value.display());
    }
    out.push_str(&next.prompt_label());
    out
}

pub fn render_completed(command: &CommandSpec, collected: &[(String, ArgumentValue)]) -> String {
    let mut out = header(command);
    for (name, value) in collected {
        let _ = writeln!(out, "{name}: {}", value.display());
    }
    out.push_str("Form completed");
    out
}

fn header(command: &CommandSpec) -> String {
    format!("{FORM_TITLE} · {}\n", command.display_name)
}
