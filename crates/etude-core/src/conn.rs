// src/conn.rs
use crate::context::ServerContext;
use crate::parser::ParseOutcome;
use crate::response::{DocumentRoot, MappedFile, Resolution};
use crate::syscalls;
use crate::writer::{SendPlan, SendStatus};
use std::net::SocketAddr;
use std::ops::Range;
use std::os::fd::RawFd;
use tracing::{debug, warn};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
}

/// What the descriptor needs next once the current handler lets go of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-arm for read readiness.
    Read,
    /// Re-arm for write readiness.
    Write,
    /// Tear the connection down.
    Close,
}

/// Per-socket protocol state. Lives in a connection table slot and is reused across
/// keep-alive exchanges and across descriptors that land on the same slot.
pub struct Conn {
    pub(crate) fd: RawFd,
    pub(crate) peer: Option<SocketAddr>,

    pub(crate) read_buf: [u8; READ_BUF_SIZE],
    pub(crate) read_len: usize,
    pub(crate) scan_pos: usize,
    pub(crate) line_start: usize,

    pub(crate) parse_state: ParseState,
    pub(crate) method: Method,
    // Parsed fields are windows into read_buf
    pub(crate) url: Range<usize>,
    pub(crate) version: Range<usize>,
    pub(crate) host: Range<usize>,
    pub(crate) content_length: usize,
    pub(crate) body_start: usize,
    pub(crate) keep_alive: bool,

    pub(crate) write_buf: [u8; WRITE_BUF_SIZE],
    pub(crate) write_len: usize,
    pub(crate) plan: SendPlan,
    pub(crate) file: Option<MappedFile>,
}

impl Conn {
    /// A fresh unused connection slot.
    pub fn empty() -> Self {
        Self {
            fd: -1,
            peer: None,
            read_buf: [0; READ_BUF_SIZE],
            read_len: 0,
            scan_pos: 0,
            line_start: 0,
            parse_state: ParseState::RequestLine,
            method: Method::Get,
            url: 0..0,
            version: 0..0,
            host: 0..0,
            content_length: 0,
            body_start: 0,
            keep_alive: false,
            write_buf: [0; WRITE_BUF_SIZE],
            write_len: 0,
            plan: SendPlan::default(),
            file: None,
        }
    }

    /// Bind the slot to a newly accepted socket.
    pub fn init(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        self.fd = fd;
        self.peer = peer;
        self.reset();
    }

    /// Return to the state of a freshly accepted connection, keeping the socket.
    /// Buffers are not cleared; the cursors alone decide what is valid.
    pub fn reset(&mut self) {
        self.read_len = 0;
        self.scan_pos = 0;
        self.line_start = 0;
        self.parse_state = ParseState::RequestLine;
        self.method = Method::Get;
        self.url = 0..0;
        self.version = 0..0;
        self.host = 0..0;
        self.content_length = 0;
        self.body_start = 0;
        self.keep_alive = false;
        self.write_len = 0;
        self.plan = SendPlan::default();
        self.file = None;
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn parse_state(&self) -> ParseState {
        self.parse_state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        std::str::from_utf8(&self.read_buf[self.url.clone()]).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        std::str::from_utf8(&self.read_buf[self.version.clone()]).unwrap_or("")
    }

    pub fn host(&self) -> &str {
        std::str::from_utf8(&self.read_buf[self.host.clone()]).unwrap_or("")
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Generated status line and headers (plus the body for error pages).
    pub fn head(&self) -> &[u8] {
        &self.write_buf[..self.write_len]
    }

    pub fn has_mapping(&self) -> bool {
        self.file.is_some()
    }

    pub fn plan(&self) -> &SendPlan {
        &self.plan
    }

    /// Drain the socket into `read_buf` until it would block.
    ///
    /// Returns `false` when the connection must be torn down: the buffer was already
    /// full, the peer closed its end, or the read failed.
    pub fn read_once(&mut self) -> bool {
        if self.read_len >= READ_BUF_SIZE {
            return false;
        }

        loop {
            if self.read_len >= READ_BUF_SIZE {
                return true;
            }
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_len..]) {
                Ok(Some(0)) => return false,
                Ok(Some(n)) => self.read_len += n,
                Ok(None) => return true,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    /// Worker entry point: parse what has been read, build the response, try the
    /// first send. The caller re-arms or tears down according to the returned step.
    pub fn process(&mut self, root: &DocumentRoot) -> Next {
        let resolution = match self.process_read() {
            ParseOutcome::NeedMoreData => return Next::Read,
            ParseOutcome::BadRequest => Resolution::BadRequest,
            ParseOutcome::GetRequest => Resolution::locate(root, self.url()),
        };

        debug!(
            fd = self.fd,
            url = self.url(),
            status = resolution.status_code(),
            keep_alive = self.keep_alive,
            "request resolved"
        );

        if let Err(e) = self.build_response(resolution) {
            warn!(fd = self.fd, error = %e, "failed to build response");
            return Next::Close;
        }

        self.write()
    }

    /// Write continuation: resume the send plan where the last attempt stopped.
    pub fn write(&mut self) -> Next {
        match self.attempt_send() {
            Ok(SendStatus::Pending) => Next::Write,
            Ok(SendStatus::Complete { keep_alive: true }) => Next::Read,
            Ok(SendStatus::Complete { keep_alive: false }) => Next::Close,
            Err(e) => {
                debug!(fd = self.fd, error = %e, "write failed");
                Next::Close
            }
        }
    }

    /// Deregister, close the socket, release any mapping and free the slot.
    /// Safe to call more than once.
    pub fn close(&mut self, ctx: &ServerContext) {
        if self.fd < 0 {
            return;
        }
        if let Err(e) = ctx.epoll.delete(self.fd) {
            debug!(fd = self.fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(self.fd);
        debug!(fd = self.fd, peer = ?self.peer, "connection closed");
        self.fd = -1;
        self.peer = None;
        self.file = None;
        ctx.connection_closed();
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(READ_BUF_SIZE - self.read_len);
        self.read_buf[self.read_len..self.read_len + n].copy_from_slice(&bytes[..n]);
        self.read_len += n;
        n
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}
