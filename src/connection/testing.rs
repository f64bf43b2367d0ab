//! Scripted in-process SMTP server for exercising the client end to end.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct Script {
    pub(crate) capabilities: Vec<&'static str>,
    pub(crate) auth_reply: &'static str,
    pub(crate) rcpt_reply: &'static str,
    /// Pause before acknowledging a message body.
    pub(crate) payload_delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            capabilities: vec![],
            auth_reply: "235 2.7.0 accepted",
            rcpt_reply: "250 ok",
            payload_delay: Duration::ZERO,
        }
    }
}

/// What the server saw on one connection. Commands are recorded verbatim,
/// message bodies separately.
#[derive(Debug, Default)]
pub(crate) struct Session {
    pub(crate) commands: Vec<String>,
    pub(crate) payloads: Vec<String>,
}

pub(crate) struct FakeServer {
    port: u16,
    handle: JoinHandle<Vec<Session>>,
}

impl FakeServer {
    /// Accepts `connections` clients one after another, then stops.
    pub(crate) fn start(script: Script, connections: usize) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            (0..connections)
                .map(|_| {
                    let (stream, _) = listener.accept().unwrap();
                    serve(stream, &script)
                })
                .collect()
        });
        FakeServer { port, handle }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn join(self) -> Vec<Session> {
        self.handle.join().unwrap()
    }
}

// The client may already have hung up.
fn reply(stream: &mut TcpStream, line: &str) {
    let _ = stream.write_all(format!("{}\r\n", line).as_bytes());
}

fn serve(mut stream: TcpStream, script: &Script) -> Session {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut session = Session::default();
    let mut login_steps = 0;
    reply(&mut stream, "220 fake.test ESMTP");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        session.commands.push(line.clone());

        if login_steps > 0 {
            login_steps -= 1;
            if login_steps > 0 {
                reply(&mut stream, "334 UGFzc3dvcmQ6");
            } else {
                reply(&mut stream, script.auth_reply);
            }
            continue;
        }

        let verb = line.split(' ').next().unwrap_or("").to_uppercase();
        match verb.as_str() {
            "EHLO" => {
                let mut lines = vec!["fake.test".to_string()];
                lines.extend(script.capabilities.iter().map(|c| c.to_string()));
                let last = lines.len() - 1;
                for (i, text) in lines.iter().enumerate() {
                    let sep = if i == last { ' ' } else { '-' };
                    reply(&mut stream, &format!("250{}{}", sep, text));
                }
            }
            "AUTH" if line.to_uppercase().starts_with("AUTH LOGIN") => {
                login_steps = 2;
                reply(&mut stream, "334 VXNlcm5hbWU6");
            }
            "AUTH" => reply(&mut stream, script.auth_reply),
            "MAIL" | "RSET" => reply(&mut stream, "250 ok"),
            "RCPT" => reply(&mut stream, script.rcpt_reply),
            "DATA" => {
                reply(&mut stream, "354 go ahead");
                let mut payload = String::new();
                loop {
                    let mut data = String::new();
                    if reader.read_line(&mut data).unwrap_or(0) == 0 {
                        return session;
                    }
                    if data == ".\r\n" {
                        break;
                    }
                    payload.push_str(&data);
                }
                session.payloads.push(payload);
                thread::sleep(script.payload_delay);
                reply(&mut stream, "250 queued");
            }
            "QUIT" => {
                reply(&mut stream, "221 bye");
                break;
            }
            _ => reply(&mut stream, "502 not implemented"),
        }
    }
    session
}
