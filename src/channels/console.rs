use super::transport::{Transport, TransportError};
use crate::shared::ids::ChatId;
use crate::value::{ImageData, ImageRef};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Terminal transport for `flowrelay chat`. Images are written to the outbox
/// directory; inbound image handles are absolute file paths.
pub struct ConsoleTransport<W> {
    out: Mutex<W>,
    outbox: PathBuf,
    next_message_id: AtomicU64,
}

impl<W: Write + Send> ConsoleTransport<W> {
    pub fn new(out: W, outbox: impl Into<PathBuf>) -> Self {
        Self {
            out: Mutex::new(out),
            outbox: outbox.into(),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> String {
        format!("m{}", self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    fn write_line(&self, chat: &ChatId, line: &str) -> Result<(), TransportError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")
            .and_then(|()| out.flush())
            .map_err(|err| TransportError::Send {
                chat: chat.to_string(),
                reason: err.to_string(),
            })
    }
}

impl<W: Write + Send> Transport for ConsoleTransport<W> {
    fn send_text(
        &self,
        chat: &ChatId,
        _reply_to: Option<&str>,
        text: &str,
    ) -> Result<String, TransportError> {
        let id = self.allocate_id();
        self.write_line(chat, &format!("relay> {}", text.replace('\n', "\n       ")))?;
        Ok(id)
    }

    fn edit_text(&self, chat: &ChatId, message_id: &str, text: &str) -> Result<(), TransportError> {
        self.write_line(chat, &format!("relay [{message_id}]> {text}"))
    }

    fn delete_message(&self, chat: &ChatId, message_id: &str) -> Result<(), TransportError> {
        self.write_line(chat, &format!("relay [{message_id}]> (deleted)"))
    }

    fn send_image(
        &self,
        chat: &ChatId,
        _reply_to: Option<&str>,
        image: &ImageData,
        caption: Option<&str>,
    ) -> Result<String, TransportError> {
        let id = self.allocate_id();
        fs::create_dir_all(&self.outbox).map_err(|source| TransportError::Io {
            path: self.outbox.display().to_string(),
            source,
        })?;
        let path = self
            .outbox
            .join(format!("{id}.{}", image_extension(&image.bytes)));
        fs::write(&path, &image.bytes).map_err(|source| TransportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut line = format!("relay> [image: {}]", path.display());
        if let Some(caption) = caption {
            line.push(' ');
            line.push_str(caption);
        }
        self.write_line(chat, &line)?;
        Ok(id)
    }

    fn fetch_image(&self, image: &ImageRef) -> Result<ImageData, TransportError> {
        let path = Path::new(&image.file_id);
        if !path.is_absolute() {
            return Err(TransportError::Fetch {
                file_id: image.file_id.clone(),
                reason: "image path must be absolute".to_string(),
            });
        }
        let bytes = fs::read(path).map_err(|source| TransportError::Io {
            path: image.file_id.clone(),
            source,
        })?;
        Ok(ImageData { bytes })
    }
}

fn image_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "jpg"
    } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(&b"WEBP"[..]) {
        "webp"
    } else {
        "bin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn images_land_in_the_outbox_and_are_announced() {
        let dir = tempdir().expect("tempdir");
        let transport = ConsoleTransport::new(Vec::new(), dir.path().join("outbox"));
        let chat = ChatId::new("local");
        let image = ImageData {
            bytes: b"\x89PNG\r\n".to_vec(),
        };
        transport
            .send_image(&chat, None, &image, None)
            .expect("send image");
        transport.send_text(&chat, None, "done").expect("send text");

        let printed = String::from_utf8(transport.into_inner()).expect("utf8");
        assert!(printed.contains("[image: "));
        assert!(printed.contains("m1.png]"));
        assert!(printed.contains("relay> done"));
        assert!(dir.path().join("outbox/m1.png").is_file());
    }

    #[test]
    fn deletes_are_announced_by_message_id() {
        let dir = tempdir().expect("tempdir");
        let transport = ConsoleTransport::new(Vec::new(), dir.path());
        let chat = ChatId::new("local");
        let id = transport.send_text(&chat, None, "String `prompt`?").expect("send");
        transport.delete_message(&chat, &id).expect("delete");

        let printed = String::from_utf8(transport.into_inner()).expect("utf8");
        assert!(printed.ends_with("relay [m1]> (deleted)\n"));
    }

    #[test]
    fn relative_image_paths_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let transport = ConsoleTransport::new(Vec::new(), dir.path());
        let err = transport
            .fetch_image(&ImageRef::new("cat.png"))
            .expect_err("relative path");
        assert!(matches!(err, TransportError::Fetch { .. }));
    }
}
