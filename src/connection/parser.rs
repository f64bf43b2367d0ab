use super::{
    protocol::{status_code, Line},
    Logger,
};
use crate::{Error, Result};
use std::io::Read;

/// Reads SMTP replies one byte at a time, keeping a single byte of lookahead.
pub(crate) struct Parser<'a, T, L>
where
    T: Read,
    L: Logger,
{
    stream: &'a mut T,
    logger: &'a mut L,
    next_char: char,
}

impl<'a, T, L> Parser<'a, T, L>
where
    T: Read,
    L: Logger,
{
    pub(crate) fn new(stream: &'a mut T, logger: &'a mut L) -> Parser<'a, T, L> {
        Parser {
            logger,
            stream,
            next_char: '\0',
        }
    }

    fn recv_char(&mut self) -> Result<char> {
        let mut buf = [0u8; 1];
        let read = self.stream.read(&mut buf).map_err(|_| Error::Network)?;
        if read == 0 {
            return Err(Error::Network);
        }
        let c = self.next_char;
        self.next_char = buf[0] as char;
        self.logger.server(&buf);
        Ok(c)
    }
    fn peek_char(&self) -> char {
        self.next_char
    }
    fn recv_digit(&mut self) -> Result<u8> {
        let c = self.recv_char()?;
        c.to_digit(10).map(|d| d as u8).ok_or(Error::Protocol)
    }
    fn expect_char(&mut self, exp: char) -> Result<()> {
        if self.recv_char()? == exp {
            Ok(())
        } else {
            Err(Error::Protocol)
        }
    }
    fn expect_end(&mut self) -> Result<()> {
        self.expect_char('\r')?;
        if self.peek_char() == '\n' {
            Ok(())
        } else {
            Err(Error::Protocol)
        }
    }
    fn recv_text(&mut self) -> Result<String> {
        let mut text = String::new();
        loop {
            let c = self.recv_char()?;
            if c == '\r' && self.peek_char() == '\n' {
                return Ok(text);
            }
            text.push(c);
        }
    }
    pub(crate) fn recv_line(&mut self) -> Result<Line> {
        // primes the lookahead, or drops the '\n' left by the previous line
        self.recv_char()?;
        let d1 = self.recv_digit()? as u32;
        let d2 = self.recv_digit()? as u32;
        let d3 = self.recv_digit()? as u32;
        let code = d1 * 100 + d2 * 10 + d3;
        let next = self.peek_char();
        let text = if next == ' ' || next == '-' {
            self.recv_char()?;
            self.recv_text()?
        } else {
            self.expect_end()?;
            String::new()
        };
        Ok(Line::new(
            status_code(code).ok_or(Error::Protocol)?,
            text,
            next != '-',
        ))
    }
    pub(crate) fn recv_reply(&mut self) -> Result<Vec<Line>> {
        let mut lines = vec![self.recv_line()?];
        while !lines[lines.len() - 1].last() {
            lines.push(self.recv_line()?);
        }
        Ok(lines)
    }
}
