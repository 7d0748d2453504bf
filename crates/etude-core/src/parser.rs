// src/parser.rs
//! Incremental HTTP/1.1 request parsing over a connection's read buffer.
//!
//! Two machines cooperate: [`Conn::scan_line`] frames CRLF-terminated lines out of
//! whatever bytes have arrived so far, and [`Conn::process_read`] walks the request
//! through request line, headers and body. Both resume from the cursors stored on the
//! connection, so a request split at any byte boundary parses exactly like one that
//! arrived in a single read.

use crate::conn::{Conn, Method, ParseState, READ_BUF_SIZE};
use memchr::{memchr, memchr2};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Complete,
    Malformed,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    NeedMoreData,
    BadRequest,
    GetRequest,
}

enum HeaderLine {
    End,
    Field,
}

impl Conn {
    /// Scan from `scan_pos` for the next line terminator.
    ///
    /// On `Complete` the terminator bytes are overwritten with NULs and `scan_pos`
    /// moves past them, leaving the line NUL-terminated in place.
    pub(crate) fn scan_line(&mut self) -> LineStatus {
        let Some(offset) = memchr2(b'\r', b'\n', &self.read_buf[self.scan_pos..self.read_len])
        else {
            self.scan_pos = self.read_len;
            return LineStatus::Incomplete;
        };
        let pos = self.scan_pos + offset;

        if self.read_buf[pos] == b'\r' {
            if pos + 1 == self.read_len {
                // Terminator split across reads; rescan from the CR next time
                self.scan_pos = pos;
                return LineStatus::Incomplete;
            }
            if self.read_buf[pos + 1] == b'\n' {
                self.read_buf[pos] = 0;
                self.read_buf[pos + 1] = 0;
                self.scan_pos = pos + 2;
                return LineStatus::Complete;
            }
            self.scan_pos = pos;
            return LineStatus::Malformed;
        }

        // Bare LF: only valid as the tail of a CR we already stepped over
        if pos > 0 && self.read_buf[pos - 1] == b'\r' {
            self.read_buf[pos - 1] = 0;
            self.read_buf[pos] = 0;
            self.scan_pos = pos + 1;
            return LineStatus::Complete;
        }
        self.scan_pos = pos;
        LineStatus::Malformed
    }

    /// The line most recently completed by `scan_line`, without its terminator.
    fn current_line(&self) -> Range<usize> {
        let end = memchr(0, &self.read_buf[self.line_start..self.scan_pos])
            .map_or(self.scan_pos, |i| self.line_start + i);
        self.line_start..end
    }

    /// Drive the request state machine over everything buffered so far.
    pub fn process_read(&mut self) -> ParseOutcome {
        loop {
            if self.parse_state == ParseState::Body {
                return if self.read_len >= self.body_start + self.content_length {
                    ParseOutcome::GetRequest
                } else {
                    ParseOutcome::NeedMoreData
                };
            }

            match self.scan_line() {
                LineStatus::Complete => {}
                LineStatus::Malformed => return ParseOutcome::BadRequest,
                LineStatus::Incomplete => return ParseOutcome::NeedMoreData,
            }

            let line = self.current_line();
            self.line_start = self.scan_pos;

            match self.parse_state {
                ParseState::RequestLine => {
                    if self.parse_request_line(line).is_none() {
                        return ParseOutcome::BadRequest;
                    }
                    self.parse_state = ParseState::Headers;
                }
                ParseState::Headers => match self.parse_header(line) {
                    Some(HeaderLine::End) => {
                        if self.content_length == 0 {
                            return ParseOutcome::GetRequest;
                        }
                        self.body_start = self.scan_pos;
                        match self.body_start.checked_add(self.content_length) {
                            Some(end) if end <= READ_BUF_SIZE => {}
                            // The body could never fit; fail now instead of stalling
                            _ => return ParseOutcome::BadRequest,
                        }
                        self.parse_state = ParseState::Body;
                    }
                    Some(HeaderLine::Field) => {}
                    None => return ParseOutcome::BadRequest,
                },
                ParseState::Body => unreachable!("body is handled before line scanning"),
            }
        }
    }

    /// `METHOD SP target SP version`, separated by spaces or tabs.
    fn parse_request_line(&mut self, line: Range<usize>) -> Option<()> {
        let buf = &self.read_buf;
        let mut cursor = line.start;

        let method = take_token(buf, &mut cursor, line.end);
        if !buf[method.clone()].eq_ignore_ascii_case(b"GET") {
            return None;
        }

        let mut url = take_token(buf, &mut cursor, line.end);
        skip_blanks(buf, &mut cursor, line.end);
        let version = cursor..line.end;

        if url.is_empty() || version.is_empty() {
            return None;
        }
        if !buf[version.clone()].eq_ignore_ascii_case(b"HTTP/1.1") {
            return None;
        }

        // Absolute-form targets: drop scheme and authority, keep the path
        for scheme in [&b"http://"[..], &b"https://"[..]] {
            let target = &buf[url.clone()];
            if target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme) {
                let authority_start = url.start + scheme.len();
                let slash = memchr(b'/', &buf[authority_start..url.end])?;
                url.start = authority_start + slash;
                break;
            }
        }

        if buf.get(url.start) != Some(&b'/') {
            return None;
        }

        self.method = Method::Get;
        self.url = url;
        self.version = version;
        Some(())
    }

    /// A single header line; `End` for the blank line closing the header block.
    fn parse_header(&mut self, line: Range<usize>) -> Option<HeaderLine> {
        if line.is_empty() {
            return Some(HeaderLine::End);
        }

        let buf = &self.read_buf;
        let Some(colon) = memchr(b':', &buf[line.clone()]) else {
            // Not a field we interpret; tolerated like any unknown header
            return Some(HeaderLine::Field);
        };
        let name = line.start..line.start + colon;
        let mut value_start = name.end + 1;
        skip_blanks(buf, &mut value_start, line.end);
        let value = value_start..line.end;

        let name_bytes = &buf[name];
        if name_bytes.eq_ignore_ascii_case(b"Connection") {
            if trim_end(&buf[value]).eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if name_bytes.eq_ignore_ascii_case(b"Content-Length") {
            // No body larger than the read buffer can ever complete
            self.content_length = parse_length(trim_end(&buf[value]))
                .filter(|&len| len <= READ_BUF_SIZE)?;
        } else if name_bytes.eq_ignore_ascii_case(b"Host") {
            self.host = value;
        }

        Some(HeaderLine::Field)
    }
}

#[inline]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn skip_blanks(buf: &[u8], cursor: &mut usize, end: usize) {
    while *cursor < end && is_blank(buf[*cursor]) {
        *cursor += 1;
    }
}

/// Skip leading blanks, then return the run of non-blank bytes and step past it.
fn take_token(buf: &[u8], cursor: &mut usize, end: usize) -> Range<usize> {
    skip_blanks(buf, cursor, end);
    let start = *cursor;
    while *cursor < end && !is_blank(buf[*cursor]) {
        *cursor += 1;
    }
    start..*cursor
}

/// `1*DIGIT`: no sign, no blanks inside, no overflow.
fn parse_length(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, &d| {
        if !d.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(usize::from(d - b'0'))
    })
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && is_blank(bytes[end - 1]) {
        end -= 1;
    }
    &bytes[..end]
}
