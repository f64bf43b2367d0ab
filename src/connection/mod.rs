mod parser;
mod protocol;
#[cfg(test)]
pub(crate) mod testing;

use crate::{check_address, config::Credentials, Config, Error, Message, Result};
use protocol::{dot_stuff, get_auth_login, AuthMech, Command, EhloLine, Line, StatusCode};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::{OwnedTrustAnchor, RootCertStore, ServerName};

type TlsCon = rustls::ClientConnection;

/// Receives every byte written to or read from the wire.
pub trait Logger {
    fn client(&mut self, data: &[u8]);
    fn server(&mut self, data: &[u8]);
    fn disable(&mut self);
    fn enable(&mut self);
}

/// Emits the SMTP transcript as `tracing` events, one per CRLF terminated
/// line.
#[derive(Default)]
pub struct TraceLogger {
    disabled: bool,
    client: Vec<u8>,
    server: Vec<u8>,
}

impl TraceLogger {
    fn flush_lines(buf: &mut Vec<u8>, side: &str) {
        while let Some(end) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=end).collect();
            tracing::trace!(
                target: "smtp_blast::wire",
                "{}: {}",
                side,
                String::from_utf8_lossy(&line).trim_end()
            );
        }
    }
}

impl Logger for TraceLogger {
    fn client(&mut self, data: &[u8]) {
        if !self.disabled {
            self.client.extend_from_slice(data);
            TraceLogger::flush_lines(&mut self.client, "C");
        }
    }
    fn server(&mut self, data: &[u8]) {
        if !self.disabled {
            self.server.extend_from_slice(data);
            TraceLogger::flush_lines(&mut self.server, "S");
        }
    }
    fn disable(&mut self) {
        if !self.disabled {
            self.disabled = true;
            tracing::trace!(target: "smtp_blast::wire", "C: <credentials redacted>");
        }
    }
    fn enable(&mut self) {
        self.disabled = false;
    }
}

/// Discards the transcript.
#[cfg(test)]
pub(crate) struct NullLogger;

#[cfg(test)]
impl Logger for NullLogger {
    fn client(&mut self, _: &[u8]) {}
    fn server(&mut self, _: &[u8]) {}
    fn disable(&mut self) {}
    fn enable(&mut self) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Support {
    Supported,
    NotSupported,
    Unknown,
}

#[derive(Clone, Copy, Debug)]
struct ServerMeta {
    auth_plain: Support,
    auth_login: Support,
    tls: Support,
    pipelining: Support,
}

impl ServerMeta {
    fn new() -> ServerMeta {
        ServerMeta {
            auth_plain: Support::Unknown,
            auth_login: Support::Unknown,
            tls: Support::Unknown,
            pipelining: Support::Unknown,
        }
    }
}

fn create_tls_conn(server_address: &str) -> Result<TlsCon> {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let name = ServerName::try_from(server_address).map_err(|e| Error::Tls(e.to_string()))?;

    TlsCon::new(Arc::new(config), name).map_err(|e| Error::Tls(e.to_string()))
}

fn stream_recv_reply<T>(stream: &mut T, logger: &mut impl Logger) -> Result<Vec<Line>>
where
    T: Read,
{
    parser::Parser::new(stream, logger).recv_reply()
}

fn stream_recv_line<T>(stream: &mut T, logger: &mut impl Logger) -> Result<Line>
where
    T: Read,
{
    let mut parser = parser::Parser::new(stream, logger);
    let line = parser.recv_line()?;
    if !line.last() {
        parser.recv_reply()?;
    }
    Ok(line)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::Dns)?
        .next()
        .ok_or(Error::Dns)
}

fn nonzero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

/// One established SMTP session. Sends QUIT when dropped while still open.
pub struct SmtpConnection<L = TraceLogger>
where
    L: Logger,
{
    name: String,
    host: String,
    meta: ServerMeta,
    tlscon: Option<TlsCon>,
    stream: TcpStream,
    logger: L,
    open: bool,
}

impl<L> SmtpConnection<L>
where
    L: Logger,
{
    /// Connects, reads the greeting, negotiates STARTTLS and authenticates as
    /// the config asks.
    pub fn open(config: &Config, logger: L) -> Result<SmtpConnection<L>> {
        let address = resolve(&config.host, config.port)?;
        let stream = match nonzero(config.connect_timeout) {
            Some(timeout) => TcpStream::connect_timeout(&address, timeout),
            None => TcpStream::connect(address),
        }
        .map_err(|_| Error::ServerUnreachable)?;
        let timeout = nonzero(config.read_timeout);
        stream
            .set_read_timeout(timeout)
            .map_err(|_| Error::Network)?;
        stream
            .set_write_timeout(timeout)
            .map_err(|_| Error::Network)?;

        let mut connection = SmtpConnection {
            name: config.helo.clone(),
            host: config.host.clone(),
            meta: ServerMeta::new(),
            tlscon: None,
            stream,
            logger,
            open: false,
        };
        connection.greeting()?;
        connection.handshake()?;
        if config.starttls {
            if connection.meta.tls != Support::Supported {
                return Err(Error::TlsNotSupported);
            }
            connection.start_tls()?;
            connection.handshake()?;
        }
        if let Some(credentials) = config.credentials.as_ref() {
            connection.authenticate(credentials)?;
        }
        Ok(connection)
    }

    fn recv_reply(&mut self) -> Result<Vec<Line>> {
        let lines = match self.tlscon.as_mut() {
            Some(tlscon) => {
                let mut tls = rustls::Stream::new(tlscon, &mut self.stream);
                stream_recv_reply(&mut tls, &mut self.logger)?
            }
            None => stream_recv_reply(&mut self.stream, &mut self.logger)?,
        };
        if lines
            .iter()
            .any(|l| l.code() == StatusCode::ServiceNotAvailable)
        {
            self.terminate();
            return Err(Error::ServerUnavailable);
        }
        Ok(lines)
    }

    fn recv_line(&mut self) -> Result<Line> {
        let line = match self.tlscon.as_mut() {
            Some(tlscon) => {
                let mut tls = rustls::Stream::new(tlscon, &mut self.stream);
                stream_recv_line(&mut tls, &mut self.logger)?
            }
            None => stream_recv_line(&mut self.stream, &mut self.logger)?,
        };
        if line.code() == StatusCode::ServiceNotAvailable {
            self.terminate();
            Err(Error::ServerUnavailable)
        } else {
            Ok(line)
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.logger.client(data);
        match self.tlscon.as_mut() {
            Some(tlscon) => {
                let mut tls = rustls::Stream::new(tlscon, &mut self.stream);
                tls.write_all(data).map_err(|_| Error::Network)?;
                tls.flush().map_err(|_| Error::Network)
            }
            None => self.stream.write_all(data).map_err(|_| Error::Network),
        }
    }

    fn send(&mut self, cmd: Command) -> Result<()> {
        self.write(cmd.to_string().as_bytes())
    }

    fn greeting(&mut self) -> Result<()> {
        let rep = self.recv_line().map_err(|_| Error::InvalidServer)?;
        rep.expect(StatusCode::ServiceReady)?;
        self.open = true;
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        self.send(Command::Ehlo(self.name.clone()))?;
        let rep = self.recv_reply()?;
        self.meta = ServerMeta::new();
        self.meta.tls = Support::NotSupported;

        for l in rep.iter() {
            l.expect(StatusCode::Okay)?;
            let text = l.text().to_uppercase();
            if text == EhloLine::StartTls.to_string() {
                self.meta.tls = Support::Supported;
            } else if text == EhloLine::Pipelining.to_string() {
                self.meta.pipelining = Support::Supported;
            } else {
                let mut words = text.split(' ');
                if words.next() == Some(EhloLine::Auth.to_string().as_str()) {
                    for word in words {
                        if word == AuthMech::Plain.to_string() {
                            self.meta.auth_plain = Support::Supported;
                        } else if word == AuthMech::Login.to_string() {
                            self.meta.auth_login = Support::Supported;
                        }
                    }
                }
            }
        }
        tracing::debug!(host = %self.host, meta = ?self.meta, "EHLO accepted");
        Ok(())
    }

    fn start_tls(&mut self) -> Result<()> {
        self.send(Command::StartTls)?;
        self.recv_line()?.expect(StatusCode::ServiceReady)?;
        self.tlscon = Some(create_tls_conn(self.host.as_str())?);
        Ok(())
    }

    fn reply_auth_result(&mut self) -> Result<()> {
        match self.recv_line()?.code() {
            StatusCode::AuthSuccess => Ok(()),
            StatusCode::AuthInvalidCred | StatusCode::NoAccess => Err(Error::InvalidCred),
            _ => Err(Error::Protocol),
        }
    }

    fn auth_plain(&mut self, credentials: &Credentials) -> Result<()> {
        self.logger.disable();
        let sent = self.send(Command::AuthPlain(
            credentials.username.clone(),
            credentials.password.clone(),
        ));
        self.logger.enable();
        sent?;
        self.reply_auth_result()
    }

    fn auth_login(&mut self, credentials: &Credentials) -> Result<()> {
        self.send(Command::AuthLogin)?;
        self.recv_line()?.expect(StatusCode::ServerChallenge)?;
        self.logger.disable();
        let sent = self.write(format!("{}\r\n", get_auth_login(&credentials.username)).as_bytes());
        self.logger.enable();
        sent?;
        self.recv_line()?.expect(StatusCode::ServerChallenge)?;
        self.logger.disable();
        let sent = self.write(format!("{}\r\n", get_auth_login(&credentials.password)).as_bytes());
        self.logger.enable();
        sent?;
        self.reply_auth_result()
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        if self.meta.auth_plain == Support::Supported {
            self.auth_plain(credentials)
        } else if self.meta.auth_login == Support::Supported {
            self.auth_login(credentials)
        } else {
            Err(Error::AuthNotSupported)
        }
    }

    fn terminate(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.tlscon.take();
        self.open = false;
    }

    /// Sends QUIT and shuts the socket down.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        let quit = self
            .send(Command::Quit)
            .and_then(|_| self.recv_line())
            .and_then(|line| line.expect(StatusCode::ServiceClosingChannel));
        self.terminate();
        quit
    }

    fn reply_mail_from(&mut self, from: &str) -> Result<()> {
        match self.recv_line()?.code() {
            StatusCode::Okay => Ok(()),
            StatusCode::NoAccess => Err(Error::Policy),
            StatusCode::MailBoxNameNotAllowed => Err(Error::MailBoxName(from.to_string())),
            _ => Err(Error::Protocol),
        }
    }

    fn reply_rcpt_to(&mut self, to: &str) -> Result<()> {
        let line = self.recv_line()?;
        match line.code() {
            StatusCode::Okay | StatusCode::UserNotLocal => Ok(()),
            StatusCode::NoAccess | StatusCode::MailboxUnavailable => Err(Error::Policy),
            StatusCode::MailBoxNameNotAllowed => Err(Error::MailBoxName(to.to_string())),
            StatusCode::UserNotLocalError => Err(Error::Forward(line.text().to_string())),
            _ => Err(Error::Protocol),
        }
    }

    fn reply_data(&mut self) -> Result<()> {
        self.recv_line()?.expect(StatusCode::StartMailInput)
    }

    fn reply_payload(&mut self) -> Result<()> {
        match self.recv_line()?.code() {
            StatusCode::Okay => Ok(()),
            StatusCode::NoAccess | StatusCode::MailboxUnavailable => Err(Error::Policy),
            StatusCode::TransactionFailed => Err(Error::Policy),
            _ => Err(Error::Protocol),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.send(Command::Rset)?;
        self.recv_line()?.expect(StatusCode::Okay)
    }

    fn pipelined(&mut self, message: &Message) -> Result<()> {
        self.send(Command::MailFrom(message.sender().to_string()))?;
        for rcpt in message.recipients() {
            self.send(Command::RcptTo(rcpt.clone()))?;
        }
        self.send(Command::Data)?;
        // every queued reply has to be read before giving up
        let mut outcome = self.reply_mail_from(message.sender());
        for rcpt in message.recipients() {
            let accepted = self.reply_rcpt_to(rcpt);
            outcome = outcome.and(accepted);
        }
        let data = self.reply_data();
        match (outcome, data) {
            (Ok(()), data) => data,
            (Err(e), Ok(())) => {
                self.write(b".\r\n")?;
                let _ = self.recv_line()?;
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn sequential(&mut self, message: &Message) -> Result<()> {
        self.send(Command::MailFrom(message.sender().to_string()))?;
        self.reply_mail_from(message.sender())?;
        for rcpt in message.recipients() {
            self.send(Command::RcptTo(rcpt.clone()))?;
            self.reply_rcpt_to(rcpt)?;
        }
        self.send(Command::Data)?;
        self.reply_data()
    }

    fn transaction(&mut self, message: &Message) -> Result<()> {
        if self.meta.pipelining == Support::Supported {
            self.pipelined(message)?;
        } else {
            self.sequential(message)?;
        }
        self.write(&dot_stuff(message.bytes()))?;
        self.write(b".\r\n")?;
        self.reply_payload()
    }

    /// Runs one MAIL/RCPT/DATA transaction on this session. A transaction
    /// refused by the server is reset so the session stays usable. After an
    /// I/O failure or timeout the stream position is unknown, so the session
    /// is shut down and every later send fails at once.
    pub fn send_mail(&mut self, message: &Message) -> Result<()> {
        if !self.open {
            return Err(Error::Network);
        }
        check_address(message.sender())?;
        for rcpt in message.recipients() {
            check_address(rcpt)?;
        }
        let result = self.transaction(message);
        match &result {
            Err(Error::Network | Error::ServerUnavailable) => self.terminate(),
            Err(Error::Policy | Error::Protocol | Error::Forward(_) | Error::MailBoxName(_))
                if self.open =>
            {
                if self.reset().is_err() {
                    self.terminate();
                }
            }
            _ => {}
        }
        result
    }
}

impl<L: Logger> Drop for SmtpConnection<L> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    use super::testing::{FakeServer, Script};
    use super::*;
    use crate::config::tests::no_prompt;

    fn config_for(port: u16, extra: &str) -> Config {
        let text = format!(
            "smtp.host = \"127.0.0.1\"\nsmtp.port = {}\nsmtp.readTimeoutMillis = 5000\nmail.to = \"a@x.com\"\n{}",
            port, extra
        );
        Config::from_toml_str(&text, no_prompt).unwrap()
    }

    fn message() -> Message {
        Message::new(
            "sender@example.com".to_string(),
            vec!["a@x.com".to_string(), "b@x.com".to_string()],
            b"Subject: hi\r\n\r\n.dot line\r\nbody\r\n".to_vec(),
        )
    }

    #[test]
    fn sends_one_transaction_per_recipient_list() {
        let server = FakeServer::start(Script::default(), 1);
        let config = config_for(server.port(), "");

        let mut connection = SmtpConnection::open(&config, NullLogger).unwrap();
        connection.send_mail(&message()).unwrap();
        connection.close().unwrap();

        let sessions = server.join();
        assert_eq!(
            sessions[0].commands,
            vec![
                "EHLO localhost",
                "MAIL FROM:<sender@example.com>",
                "RCPT TO:<a@x.com>",
                "RCPT TO:<b@x.com>",
                "DATA",
                "QUIT",
            ]
        );
        assert_eq!(sessions[0].payloads, vec!["Subject: hi\r\n\r\n..dot line\r\nbody\r\n"]);
    }

    #[test]
    fn pipelines_when_offered() {
        let script = Script {
            capabilities: vec!["PIPELINING"],
            ..Script::default()
        };
        let server = FakeServer::start(script, 1);
        let config = config_for(server.port(), "");

        let mut connection = SmtpConnection::open(&config, NullLogger).unwrap();
        connection.send_mail(&message()).unwrap();
        drop(connection);

        let sessions = server.join();
        assert_eq!(sessions[0].payloads.len(), 1);
        assert_eq!(sessions[0].commands.last().map(String::as_str), Some("QUIT"));
    }

    #[test]
    fn authenticates_with_plain() {
        let script = Script {
            capabilities: vec!["AUTH PLAIN LOGIN"],
            ..Script::default()
        };
        let server = FakeServer::start(script, 1);
        let config = config_for(
            server.port(),
            "smtp.auth.enabled = true\nsmtp.username = \"user\"\nsmtp.password = \"pass\"",
        );

        SmtpConnection::open(&config, NullLogger).unwrap();

        let sessions = server.join();
        assert_eq!(sessions[0].commands[1], "AUTH PLAIN AHVzZXIAcGFzcw==");
    }

    #[test]
    fn authenticates_with_login() {
        let script = Script {
            capabilities: vec!["AUTH LOGIN"],
            ..Script::default()
        };
        let server = FakeServer::start(script, 1);
        let config = config_for(
            server.port(),
            "smtp.auth.enabled = true\nsmtp.username = \"user\"\nsmtp.password = \"pass\"",
        );

        SmtpConnection::open(&config, NullLogger).unwrap();

        let sessions = server.join();
        assert_eq!(
            sessions[0].commands[1..4].to_vec(),
            vec!["AUTH LOGIN", "dXNlcg==", "cGFzcw=="]
        );
    }

    #[test]
    fn rejected_credentials() {
        let script = Script {
            capabilities: vec!["AUTH PLAIN"],
            auth_reply: "535 5.7.8 bad credentials",
            ..Script::default()
        };
        let server = FakeServer::start(script, 1);
        let config = config_for(
            server.port(),
            "smtp.auth.enabled = true\nsmtp.password = \"wrong\"",
        );

        let err = SmtpConnection::open(&config, NullLogger).err();

        assert_eq!(err, Some(Error::InvalidCred));
        server.join();
    }

    #[test]
    fn starttls_must_be_offered() {
        let server = FakeServer::start(Script::default(), 1);
        let config = config_for(server.port(), "smtp.starttls.enabled = true");

        let err = SmtpConnection::open(&config, NullLogger).err();

        assert_eq!(err, Some(Error::TlsNotSupported));
        server.join();
    }

    #[test]
    fn refused_recipient_is_a_policy_error() {
        let script = Script {
            rcpt_reply: "550 no such user",
            ..Script::default()
        };
        let server = FakeServer::start(script, 1);
        let config = config_for(server.port(), "");

        let mut connection = SmtpConnection::open(&config, NullLogger).unwrap();
        assert_eq!(connection.send_mail(&message()), Err(Error::Policy));
        drop(connection);

        server.join();
    }

    #[test]
    fn timed_out_session_is_shut_down() {
        let script = Script {
            payload_delay: Duration::from_millis(600),
            ..Script::default()
        };
        let server = FakeServer::start(script, 1);
        let mut config = config_for(server.port(), "");
        config.read_timeout = Some(Duration::from_millis(200));

        let mut connection = SmtpConnection::open(&config, NullLogger).unwrap();
        assert_eq!(connection.send_mail(&message()), Err(Error::Network));
        let started = Instant::now();
        assert_eq!(connection.send_mail(&message()), Err(Error::Network));
        assert!(started.elapsed() < Duration::from_millis(200));
        drop(connection);

        let sessions = server.join();
        assert_eq!(
            sessions[0].commands,
            vec![
                "EHLO localhost",
                "MAIL FROM:<sender@example.com>",
                "RCPT TO:<a@x.com>",
                "RCPT TO:<b@x.com>",
                "DATA",
            ]
        );
        assert_eq!(sessions[0].payloads.len(), 1);
    }

    #[test]
    fn malformed_address_never_reaches_the_server() {
        let server = FakeServer::start(Script::default(), 1);
        let config = config_for(server.port(), "");
        let bad = Message::new("sender@example.com".to_string(), vec!["nope".to_string()], vec![]);

        let mut connection = SmtpConnection::open(&config, NullLogger).unwrap();
        assert_eq!(
            connection.send_mail(&bad),
            Err(Error::MailBoxName("nope".to_string()))
        );
        drop(connection);

        let sessions = server.join();
        assert_eq!(sessions[0].commands, vec!["EHLO localhost", "QUIT"]);
    }

    #[test]
    fn unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = config_for(port, "smtp.connectionTimeoutMillis = 500");

        let err = SmtpConnection::open(&config, NullLogger).err();

        assert_eq!(err, Some(Error::ServerUnreachable));
    }

    #[test]
    fn trace_logger_splits_lines() {
        let mut logger = TraceLogger::default();
        logger.server(b"250-a\r\n25");
        assert_eq!(logger.server, b"25".to_vec());
        logger.disable();
        logger.client(b"AUTH PLAIN secret\r\n");
        assert!(logger.client.is_empty());
    }
}
