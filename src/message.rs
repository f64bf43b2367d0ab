use crate::{check_address, Config, ContentType, Error, Result};
use mail_builder::MessageBuilder;
use std::{fs, path::Path, sync::Arc};

const FALLBACK_MIME: &str = "application/octet-stream";

/// A rendered message plus the envelope it travels under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: String,
    recipients: Vec<String>,
    bytes: Vec<u8>,
}

impl Message {
    pub fn new(sender: String, recipients: Vec<String>, bytes: Vec<u8>) -> Message {
        Message {
            sender,
            recipients,
            bytes,
        }
    }
    pub fn sender(&self) -> &str {
        &self.sender
    }
    /// To, Cc and Bcc addresses, in that order.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Builds the message for one sequence number.
pub trait Compose: Send + Sync {
    fn compose(&self, sequence: u64) -> Result<Message>;
}

pub struct MailComposer {
    config: Arc<Config>,
}

fn path_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn addresses(list: &[String]) -> Result<Vec<&str>> {
    list.iter()
        .map(|address| check_address(address).map(|_| address.as_str()))
        .collect()
}

impl MailComposer {
    pub fn new(config: Arc<Config>) -> MailComposer {
        MailComposer { config }
    }
}

impl Compose for MailComposer {
    fn compose(&self, sequence: u64) -> Result<Message> {
        let config = &self.config;
        check_address(&config.from)?;
        let to = addresses(&config.to)?;
        let cc = addresses(&config.cc)?;
        // Bcc addresses travel in the envelope only, never in the headers.
        addresses(&config.bcc)?;
        let subject = format!("{} (#{})", config.subject, sequence);

        let mut builder = MessageBuilder::new()
            .from(config.from.as_str())
            .to(to)
            .subject(subject.as_str());
        if !cc.is_empty() {
            builder = builder.cc(cc);
        }
        builder = match config.content_type {
            ContentType::Plain => builder.text_body(config.inline_content.as_str()),
            ContentType::Html => builder.html_body(config.inline_content.as_str()),
        };
        if let Some(path) = config.attachment.as_deref() {
            let shown = path.display().to_string();
            let content = fs::read(path).map_err(|_| Error::File(shown))?;
            let mime = infer::get(&content)
                .map(|kind| kind.mime_type())
                .unwrap_or(FALLBACK_MIME)
                .to_string();
            builder = builder.binary_attachment(mime, path_file_name(path), content);
        }
        let bytes = builder
            .write_to_vec()
            .map_err(|e| Error::Render(e.to_string()))?;

        let recipients = config
            .to
            .iter()
            .chain(config.cc.iter())
            .chain(config.bcc.iter())
            .cloned()
            .collect();
        Ok(Message::new(config.from.clone(), recipients, bytes))
    }
}
