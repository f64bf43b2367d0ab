pub mod config;
pub mod connection;
pub mod dispatch;
pub mod message;
pub mod transport;

use std::sync::OnceLock;

pub use config::{Config, ContentType};
pub use connection::{Logger, SmtpConnection, TraceLogger};
pub use dispatch::{Dispatch, Dispatcher, Event, Plan, Reporter, Summary};
pub use message::{Compose, MailComposer, Message};
pub use transport::{SmtpTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to read file: {0}")]
    File(String),
    #[error("failed to render message: {0}")]
    Render(String),
    #[error("there was an error on the mail server side")]
    Protocol,
    #[error("can't reach the server")]
    ServerUnreachable,
    #[error("server abruptly ended the connection")]
    ServerUnavailable,
    #[error("the server address is probably not an SMTP one")]
    InvalidServer,
    #[error("disconnected due to a network issue")]
    Network,
    #[error("failed to resolve hostname")]
    Dns,
    #[error("TLS negotiation failed: {0}")]
    Tls(String),
    #[error("server does not offer STARTTLS")]
    TlsNotSupported,
    #[error("server does not offer a supported AUTH mechanism")]
    AuthNotSupported,
    #[error("the credentials were rejected by the server")]
    InvalidCred,
    #[error("the request was rejected by the server due to policy")]
    Policy,
    #[error("invalid email address <{0}>")]
    MailBoxName(String),
    #[error("the address has moved: {0}")]
    Forward(String),
    #[error("failed to start worker: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn address_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(
            r"^([a-zA-Z0-9_+\-]([a-zA-Z0-9_+.\-]*[a-zA-Z0-9_+\-])?)@([a-zA-Z0-9]+([\-\.]{1}[a-zA-Z0-9]+)*\.[a-zA-Z]{2,63})$",
        )
        .expect("address pattern is valid")
    })
}

pub fn check_address(address: &str) -> Result<()> {
    address_pattern()
        .captures(address)
        .map(|_| ())
        .ok_or(Error::MailBoxName(address.to_string()))
}
