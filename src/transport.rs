use std::sync::Arc;

use crate::{Config, Message, Result, SmtpConnection, TraceLogger};

/// Opens, uses and closes SMTP sessions on behalf of the dispatch workers.
pub trait Transport: Send + Sync {
    type Connection: Send;

    fn connect(&self) -> Result<Self::Connection>;

    fn send_via(&self, connection: &mut Self::Connection, message: &Message) -> Result<()>;

    fn close(&self, connection: Self::Connection) -> Result<()>;

    /// One full connect, send, close cycle. The session is closed even when
    /// the send fails. The outcome is that of the send; a failed close after
    /// an accepted message is only logged.
    fn send(&self, message: &Message) -> Result<()> {
        let mut connection = self.connect()?;
        let sent = self.send_via(&mut connection, message);
        if let Err(error) = self.close(connection) {
            tracing::warn!(%error, "failed to close connection");
        }
        sent
    }
}

pub struct SmtpTransport {
    config: Arc<Config>,
}

impl SmtpTransport {
    pub fn new(config: Arc<Config>) -> SmtpTransport {
        SmtpTransport { config }
    }
}

impl Transport for SmtpTransport {
    type Connection = SmtpConnection<TraceLogger>;

    fn connect(&self) -> Result<Self::Connection> {
        SmtpConnection::open(&self.config, TraceLogger::default())
    }

    fn send_via(&self, connection: &mut Self::Connection, message: &Message) -> Result<()> {
        connection.send_mail(message)
    }

    fn close(&self, mut connection: Self::Connection) -> Result<()> {
        connection.close()
    }
}
