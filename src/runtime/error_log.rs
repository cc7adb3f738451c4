use crate::shared::ids::{ChatId, UserId};
use crate::value::ArgumentValue;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const FILE_TIMESTAMP_FORMAT: &str = "%d-%m-%Y_%H.%M.%S";

/// One failed job, written as a standalone text file for later inspection.
#[derive(Debug, Clone, Copy)]
pub struct ErrorReport<'a> {
    pub chat_id: &'a ChatId,
    pub user_id: &'a UserId,
    pub command_name: &'a str,
    pub arguments: &'a BTreeMap<String, ArgumentValue>,
    pub error: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLog {
    dir: PathBuf,
}

impl ErrorLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self, report: &ErrorReport<'_>) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stamp = chrono::Utc::now().format(FILE_TIMESTAMP_FORMAT);
        let path = self.dir.join(format!(
            "{stamp} {} {}.txt",
            file_safe(report.chat_id.as_str()),
            file_safe(report.user_id.as_str())
        ));
        let arguments = serde_json::to_string_pretty(report.arguments)
            .unwrap_or_else(|err| format!("<unserializable arguments: {err}>"));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "command: /{}", report.command_name)?;
        writeln!(file, "chat: {}", report.chat_id)?;
        writeln!(file, "user: {}", report.user_id)?;
        writeln!(file, "arguments: {arguments}")?;
        writeln!(file, "error: {}", report.error)?;
        Ok(path)
    }
}

fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
