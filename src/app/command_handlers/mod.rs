use crate::app::cli::{help_text, parse_cli_verb, CliVerb};
use crate::app::command_support::split_config_flag;

pub mod chat;
pub mod workflows;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let (config, args) = split_config_flag(&args)?;
    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Workflows => workflows::cmd_workflows(config, &args[1..]),
        CliVerb::Check => workflows::cmd_check(config),
        CliVerb::Chat => chat::cmd_chat(config, &args[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}
