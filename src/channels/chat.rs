use super::transport::{ChatKind, InboundMessage};
use crate::app::dispatcher::Dispatcher;
use crate::shared::ids::{ChatId, UserId};
use crate::value::ImageRef;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

const CHAT_EXIT_COMMANDS: &[&str] = &["/exit", "exit", "quit"];
const CHAT_JOB_TIMEOUT: Duration = Duration::from_secs(600);
const IMAGE_TAG: &str = "[image:";

/// Who the terminal user is to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub user_name: String,
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self {
            chat_id: ChatId::new("local"),
            user_id: UserId::new("local-user"),
            user_name: "you".to_string(),
        }
    }
}

pub fn run_local_chat_stdio(
    dispatcher: &Dispatcher,
    identity: &LocalIdentity,
) -> Result<String, String> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    run_local_chat(dispatcher, identity, &mut input, &mut output)
}

/// Feeds terminal lines to the dispatcher as private chat messages. A line may
/// attach one image with `[image: /absolute/path]`. After a job is admitted
/// the loop waits for the queue to go idle so outputs print before the next
/// prompt.
pub fn run_local_chat<R: BufRead, W: Write>(
    dispatcher: &Dispatcher,
    identity: &LocalIdentity,
    input: &mut R,
    output: &mut W,
) -> Result<String, String> {
    writeln!(output, "chat id={} user id={}", identity.chat_id, identity.user_id)
        .map_err(|e| format!("failed to write chat output: {e}"))?;
    writeln!(output, "type `/help` for commands, `/exit` to quit")
        .map_err(|e| format!("failed to write chat output: {e}"))?;

    let mut sent = 0u64;
    let mut jobs = 0u64;
    loop {
        write!(output, "you> ").map_err(|e| format!("failed to write chat prompt: {e}"))?;
        output
            .flush()
            .map_err(|e| format!("failed to flush chat prompt: {e}"))?;

        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .map_err(|e| format!("failed to read chat input: {e}"))?;
        if read == 0 {
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_chat_exit_command(line) {
            break;
        }

        let (text, image, omitted) = strip_image_tag(line);
        for path in omitted {
            writeln!(output, "skipping `{path}`: not an absolute path to a file")
                .map_err(|e| format!("failed to write chat output: {e}"))?;
        }
        sent += 1;
        let message = InboundMessage {
            message_id: format!("u{sent}"),
            chat_id: identity.chat_id.clone(),
            chat_kind: ChatKind::Private,
            sender_id: identity.user_id.clone(),
            sender_name: identity.user_name.clone(),
            text: (!text.is_empty()).then_some(text),
            image,
        };

        let outcome = dispatcher.handle(&message);
        if outcome.admitted().is_some() {
            jobs += 1;
            if !dispatcher.queue().wait_idle(CHAT_JOB_TIMEOUT) {
                writeln!(output, "job still running, its output will follow")
                    .map_err(|e| format!("failed to write chat output: {e}"))?;
            }
        }
    }

    Ok(format!("chat ended\nmessages={sent}\njobs={jobs}"))
}

fn is_chat_exit_command(message: &str) -> bool {
    CHAT_EXIT_COMMANDS
        .iter()
        .any(|command| message.eq_ignore_ascii_case(command))
}

/// Removes `[image: ...]` tags. The first readable absolute path becomes the
/// attachment; other candidates are reported back.
fn strip_image_tag(message: &str) -> (String, Option<ImageRef>, Vec<String>) {
    let mut text = String::with_capacity(message.len());
    let mut image = None;
    let mut omitted = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = message[cursor..].find(IMAGE_TAG) {
        let tag_start = cursor + rel_start;
        text.push_str(&message[cursor..tag_start]);

        let content_start = tag_start + IMAGE_TAG.len();
        let Some(rel_end) = message[content_start..].find(']') else {
            text.push_str(&message[tag_start..]);
            cursor = message.len();
            break;
        };
        let tag_end = content_start + rel_end;
        let candidate = message[content_start..tag_end].trim();
        if !candidate.is_empty() {
            let path = Path::new(candidate);
            if image.is_none() && path.is_absolute() && path.is_file() {
                image = Some(ImageRef::new(candidate));
            } else {
                omitted.push(candidate.to_string());
            }
        }
        cursor = tag_end + 1;
    }

    if cursor < message.len() {
        text.push_str(&message[cursor..]);
    }
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (text, image, omitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn image_tag_becomes_attachment_and_caption_stays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("cat.png");
        fs::write(&file, b"png").expect("write image");

        let line = format!("/upscale --scale 2 [image: {}]", file.display());
        let (text, image, omitted) = strip_image_tag(&line);
        assert_eq!(text, "/upscale --scale 2");
        assert_eq!(image, Some(ImageRef::new(file.display().to_string())));
        assert!(omitted.is_empty());
    }

    #[test]
    fn relative_and_missing_paths_are_omitted() {
        let (text, image, omitted) = strip_image_tag("hi [image: cat.png] [image: /no/such.png]");
        assert_eq!(text, "hi");
        assert!(image.is_none());
        assert_eq!(omitted, vec!["cat.png".to_string(), "/no/such.png".to_string()]);
    }

    #[test]
    fn unterminated_tag_is_left_as_text() {
        let (text, image, _) = strip_image_tag("look [image: /tmp/x.png");
        assert_eq!(text, "look [image: /tmp/x.png");
        assert!(image.is_none());
    }

    #[test]
    fn exit_commands_ignore_case() {
        assert!(is_chat_exit_command("/EXIT"));
        assert!(is_chat_exit_command("quit"));
        assert!(!is_chat_exit_command("/help"));
    }
}
