use serde_derive::Deserialize;
use std::{fmt, fs, path::Path, path::PathBuf, time::Duration};

use crate::{Error, Result};

pub const DEFAULT_FROM: &str = "no-reply@example.com";
pub const DEFAULT_SUBJECT: &str = "Default Email Subject";
pub const DEFAULT_CONTENT: &str = "Default Email Content";
pub const DEFAULT_HELO: &str = "localhost";

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct Toggle {
    enabled: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SmtpSection {
    host: Option<String>,
    port: Option<u16>,
    auth: Option<Toggle>,
    username: Option<String>,
    password: Option<String>,
    starttls: Option<Toggle>,
    helo: Option<String>,
    #[serde(rename = "connectionTimeoutMillis")]
    connection_timeout_millis: Option<u64>,
    #[serde(rename = "readTimeoutMillis")]
    read_timeout_millis: Option<u64>,
    #[serde(rename = "connectionReuse")]
    connection_reuse: Option<bool>,
    #[serde(rename = "mailsPerThread")]
    mails_per_thread: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AttachmentSection {
    enabled: Option<bool>,
    path: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MailSection {
    from: Option<String>,
    #[serde(rename = "workerThreads")]
    worker_threads: Option<usize>,
    #[serde(rename = "msgPerThread", alias = "mailsPerThread")]
    msg_per_thread: Option<u64>,
    #[serde(rename = "totalEmails")]
    total_emails: Option<u64>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    to: Option<String>,
    cc: Option<String>,
    bcc: Option<String>,
    subject: Option<String>,
    #[serde(rename = "inlineContent")]
    inline_content: Option<String>,
    attachment: Option<AttachmentSection>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    smtp: Option<SmtpSection>,
    mail: Option<MailSection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Plain,
    Html,
}

impl ContentType {
    pub fn parse(value: &str) -> Result<ContentType> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" | "text/plain" => Ok(ContentType::Plain),
            "html" | "text/html" => Ok(ContentType::Html),
            other => Err(Error::Config(format!(
                "mail.contentType must be `text` or `html`, got `{}`",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Credentials {
        Credentials { username, password }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings for one dispatch run. Built once at startup and shared read-only
/// by every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub helo: String,
    /// Present only when `smtp.auth.enabled` is set.
    pub credentials: Option<Credentials>,
    pub starttls: bool,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub connection_reuse: bool,
    pub from: String,
    pub workers: usize,
    pub per_worker: u64,
    /// Cap on send attempts across all workers.
    pub total_cap: u64,
    pub content_type: ContentType,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub inline_content: String,
    /// Present only when `mail.attachment.enabled` is set and a path is given.
    pub attachment: Option<PathBuf>,
}

/// Splits a comma separated recipient list. Entries are trimmed and blanks
/// dropped.
pub fn parse_recipients(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn missing(key: &str) -> Error {
    Error::Config(format!("missing required key `{}`", key))
}

impl Config {
    /// Reads and validates the config file at `path`. `prompt` is asked for
    /// the password when auth is enabled and none is configured.
    pub fn load<P, F>(path: P, prompt: F) -> Result<Config>
    where
        P: AsRef<Path>,
        F: FnOnce(&str) -> Result<String>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("can't read {}: {}", path.display(), e)))?;
        Config::from_toml_str(&text, prompt)
    }

    pub fn from_toml_str<F>(text: &str, prompt: F) -> Result<Config>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        file.destruct(prompt)
    }
}

impl ConfigFile {
    fn destruct<F>(self, prompt: F) -> Result<Config>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let smtp = self.smtp.ok_or_else(|| missing("smtp.host"))?;
        let mail = self.mail.ok_or_else(|| missing("mail.to"))?;

        let host = smtp.host.ok_or_else(|| missing("smtp.host"))?;
        let port = smtp.port.ok_or_else(|| missing("smtp.port"))?;

        let to = parse_recipients(&mail.to.ok_or_else(|| missing("mail.to"))?);
        if to.is_empty() {
            return Err(Error::Config("`mail.to` has no recipients".to_string()));
        }
        let cc = mail.cc.as_deref().map(parse_recipients).unwrap_or_default();
        let bcc = mail.bcc.as_deref().map(parse_recipients).unwrap_or_default();

        let from = mail.from.unwrap_or_else(|| DEFAULT_FROM.to_string());

        let workers = mail.worker_threads.unwrap_or(1);
        if workers == 0 {
            return Err(Error::Config(
                "`mail.workerThreads` must be at least 1".to_string(),
            ));
        }
        let per_worker = mail.msg_per_thread.or(smtp.mails_per_thread).unwrap_or(1);
        let total_cap = match mail.total_emails {
            Some(total) => total,
            None => (workers as u64).saturating_mul(per_worker),
        };

        let auth_enabled = smtp.auth.unwrap_or_default().enabled.unwrap_or(false);
        let credentials = if auth_enabled {
            let username = smtp.username.unwrap_or_else(|| from.clone());
            let password = match smtp.password {
                Some(password) => password,
                None => prompt(&username)?,
            };
            Some(Credentials::new(username, password))
        } else {
            None
        };

        let content_type = match mail.content_type {
            Some(value) => ContentType::parse(&value)?,
            None => ContentType::Plain,
        };

        let attachment = mail.attachment.unwrap_or_default();
        let attachment = if attachment.enabled.unwrap_or(false) {
            attachment.path.map(PathBuf::from)
        } else {
            None
        };

        Ok(Config {
            host,
            port,
            helo: smtp.helo.unwrap_or_else(|| DEFAULT_HELO.to_string()),
            credentials,
            starttls: smtp.starttls.unwrap_or_default().enabled.unwrap_or(false),
            connect_timeout: smtp.connection_timeout_millis.map(Duration::from_millis),
            read_timeout: smtp.read_timeout_millis.map(Duration::from_millis),
            connection_reuse: smtp.connection_reuse.unwrap_or(false),
            from,
            workers,
            per_worker,
            total_cap,
            content_type,
            to,
            cc,
            bcc,
            subject: mail.subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            inline_content: mail
                .inline_content
                .unwrap_or_else(|| DEFAULT_CONTENT.to_string()),
            attachment,
        })
    }
}
