use base64::{engine::general_purpose, Engine};
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StatusCode {
    SystemStatus = 211,
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosingChannel = 221,
    AuthSuccess = 235,
    Okay = 250,
    UserNotLocal = 251,
    CanNotVrfyButWillAttempt = 252,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailable = 421,
    PasswordTransition = 432,
    MailboxUnavailable = 450,
    LocalError = 451,
    InsufficientStorage = 452,
    TempAuthFailure = 454,
    AccomodateParams = 455,
    AuthLineTooLong = 500,
    SyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequence = 503,
    ParamNotImplemented = 504,
    AuthRequired = 530,
    AuthMechWeak = 534,
    AuthInvalidCred = 535,
    AuthEncryptRequired = 538,
    NoAccess = 550,
    UserNotLocalError = 551,
    ExceededAllocation = 552,
    MailBoxNameNotAllowed = 553,
    TransactionFailed = 554,
    ParamsNotRecognized = 555,
}

pub fn status_code(code: u32) -> Option<StatusCode> {
    match code {
        211 => Some(StatusCode::SystemStatus),
        214 => Some(StatusCode::HelpMessage),
        220 => Some(StatusCode::ServiceReady),
        221 => Some(StatusCode::ServiceClosingChannel),
        235 => Some(StatusCode::AuthSuccess),
        250 => Some(StatusCode::Okay),
        251 => Some(StatusCode::UserNotLocal),
        252 => Some(StatusCode::CanNotVrfyButWillAttempt),
        334 => Some(StatusCode::ServerChallenge),
        354 => Some(StatusCode::StartMailInput),
        421 => Some(StatusCode::ServiceNotAvailable),
        432 => Some(StatusCode::PasswordTransition),
        450 => Some(StatusCode::MailboxUnavailable),
        451 => Some(StatusCode::LocalError),
        452 => Some(StatusCode::InsufficientStorage),
        454 => Some(StatusCode::TempAuthFailure),
        455 => Some(StatusCode::AccomodateParams),
        500 => Some(StatusCode::AuthLineTooLong),
        501 => Some(StatusCode::SyntaxError),
        502 => Some(StatusCode::CommandNotImplemented),
        503 => Some(StatusCode::BadSequence),
        504 => Some(StatusCode::ParamNotImplemented),
        530 => Some(StatusCode::AuthRequired),
        534 => Some(StatusCode::AuthMechWeak),
        535 => Some(StatusCode::AuthInvalidCred),
        538 => Some(StatusCode::AuthEncryptRequired),
        550 => Some(StatusCode::NoAccess),
        551 => Some(StatusCode::UserNotLocalError),
        552 => Some(StatusCode::ExceededAllocation),
        553 => Some(StatusCode::MailBoxNameNotAllowed),
        554 => Some(StatusCode::TransactionFailed),
        555 => Some(StatusCode::ParamsNotRecognized),
        _ => None,
    }
}

#[derive(Debug)]
pub struct Line {
    code: StatusCode,
    text: String,
    last: bool,
}

impl Line {
    pub fn new(code: StatusCode, text: String, last: bool) -> Line {
        Line { code, text, last }
    }

    pub fn expect(&self, code: StatusCode) -> Result<()> {
        if self.code != code {
            Err(Error::Protocol)
        } else {
            Ok(())
        }
    }
    pub fn code(&self) -> StatusCode {
        self.code
    }
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn last(&self) -> bool {
        self.last
    }
}

pub enum EhloLine {
    Pipelining,
    StartTls,
    Auth,
}

impl fmt::Display for EhloLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EhloLine::Pipelining => "PIPELINING",
            EhloLine::StartTls => "STARTTLS",
            EhloLine::Auth => "AUTH",
        })
    }
}

pub enum AuthMech {
    Plain,
    Login,
}

impl fmt::Display for AuthMech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMech::Plain => "PLAIN",
            AuthMech::Login => "LOGIN",
        })
    }
}

pub enum Command {
    Ehlo(String),
    Quit,
    StartTls,
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    AuthPlain(String, String),
    AuthLogin,
}

pub fn get_auth_plain(username: &str, password: &str) -> String {
    let mut s = vec![0u8];
    s.extend_from_slice(username.as_bytes());
    s.push(0u8);
    s.extend_from_slice(password.as_bytes());
    general_purpose::STANDARD.encode(s)
}

pub fn get_auth_login(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Data => write!(f, "DATA"),
            Command::Rset => write!(f, "RSET"),
            Command::Ehlo(me) => write!(f, "EHLO {}", me),
            Command::StartTls => write!(f, "STARTTLS"),
            Command::Quit => write!(f, "QUIT"),
            Command::MailFrom(from) => write!(f, "MAIL FROM:<{}>", from),
            Command::RcptTo(to) => write!(f, "RCPT TO:<{}>", to),
            Command::AuthPlain(un, pw) => write!(f, "AUTH PLAIN {}", get_auth_plain(un, pw)),
            Command::AuthLogin => write!(f, "AUTH LOGIN"),
        }?;
        f.write_str("\r\n")
    }
}

/// Escapes lines starting with `.` and makes sure the payload ends with CRLF,
/// so the terminating `.` line can follow directly.
pub fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 16);
    let mut line_start = true;
    for &byte in payload {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Command::Ehlo("me".to_string()), "EHLO me\r\n")]
    #[case(Command::MailFrom("a@x.com".to_string()), "MAIL FROM:<a@x.com>\r\n")]
    #[case(Command::RcptTo("b@x.com".to_string()), "RCPT TO:<b@x.com>\r\n")]
    #[case(Command::Quit, "QUIT\r\n")]
    #[case(Command::AuthPlain("user".to_string(), "pass".to_string()), "AUTH PLAIN AHVzZXIAcGFzcw==\r\n")]
    fn commands_render_with_crlf(#[case] command: Command, #[case] wire: &str) {
        assert_eq!(command.to_string(), wire);
    }

    #[test]
    fn login_tokens_are_base64() {
        assert_eq!(get_auth_login("user"), "dXNlcg==");
    }

    #[test]
    fn leading_dots_are_doubled() {
        assert_eq!(
            dot_stuff(b".start\r\nmiddle\r\n.\r\n..two\r\n"),
            b"..start\r\nmiddle\r\n..\r\n...two\r\n".to_vec()
        );
    }

    #[test]
    fn missing_final_crlf_is_added() {
        assert_eq!(dot_stuff(b"body"), b"body\r\n".to_vec());
    }

    #[test]
    fn unknown_codes_are_not_mapped() {
        assert_eq!(status_code(250), Some(StatusCode::Okay));
        assert_eq!(status_code(299), None);
    }
}
