#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Workflows,
    Check,
    Chat,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "workflows" => CliVerb::Workflows,
        "check" => CliVerb::Check,
        "chat" => CliVerb::Chat,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: flowrelay [--config <path>] <command> ...".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  workflows list                       List the commands compiled from workflows"
            .to_string(),
        "  workflows show <command>             Show ports, bounds and defaults of a command"
            .to_string(),
        "  check                                Compile every workflow and report failures"
            .to_string(),
        "  chat                                 Talk to the dispatcher from this terminal"
            .to_string(),
        "  help                                 Show this help".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}
