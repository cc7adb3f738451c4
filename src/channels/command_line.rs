use std::collections::BTreeMap;

/// Inline free text binds to this argument when the workflow declares it.
pub const FREE_TEXT_ARGUMENT: &str = "prompt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub arguments: BTreeMap<String, String>,
}

/// Parses `/name[@bot] free text --arg value --other more words`.
///
/// Free text before the first `--` becomes the `prompt` argument. A flag
/// without a value is dropped. Returns `None` for non-command text.
pub fn parse_command_line(text: &str) -> Option<ParsedCommand> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, tail) = match rest.find(char::is_whitespace) {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or_default();
    if name.is_empty() {
        return None;
    }

    let mut arguments = BTreeMap::new();
    let mut segments = tail.split("--");
    let free_text = segments.next().unwrap_or_default().trim();
    if !free_text.is_empty() {
        arguments.insert(FREE_TEXT_ARGUMENT.to_string(), free_text.to_string());
    }
    for segment in segments {
        let mut words = segment.split_whitespace();
        let Some(key) = words.next() else {
            continue;
        };
        let value = words.collect::<Vec<_>>().join(" ");
        if value.is_empty() {
            continue;
        }
        arguments.insert(key.to_string(), value);
    }

    Some(ParsedCommand {
        name: name.to_string(),
        arguments,
    })
}
