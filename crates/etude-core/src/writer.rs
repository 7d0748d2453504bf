// src/writer.rs
use crate::conn::Conn;
use crate::error::EtudeResult;
use crate::syscalls;

/// Remaining work of a response: header bytes `write_buf[head_pos..head_end]` followed by
/// mapped file bytes `file[file_pos..]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendPlan {
    head_pos: usize,
    head_end: usize,
    file_pos: usize,
    bytes_total: usize,
    bytes_sent: usize,
}

impl SendPlan {
    pub(crate) fn start(&mut self, head_len: usize, file_len: usize) {
        *self = Self {
            head_pos: 0,
            head_end: head_len,
            file_pos: 0,
            bytes_total: head_len + file_len,
            bytes_sent: 0,
        };
    }

    /// Account for `n` bytes accepted by the socket: shrink the header range first and
    /// spill whatever overshoots it into the file range.
    fn advance(&mut self, n: usize) {
        self.bytes_sent += n;
        let head_left = self.head_end - self.head_pos;
        if n < head_left {
            self.head_pos += n;
        } else {
            self.head_pos = self.head_end;
            self.file_pos += n - head_left;
        }
    }

    pub fn bytes_total(&self) -> usize {
        self.bytes_total
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.bytes_total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything went out. With `keep_alive` the connection is already reset for the
    /// next request; otherwise the caller closes it.
    Complete { keep_alive: bool },
    /// The socket would block; re-arm for write readiness and call again.
    Pending,
}

impl Conn {
    /// Push the send plan out with vectored writes until it is done or the socket
    /// would block. A hard error releases the mapping and is returned to the caller.
    pub fn attempt_send(&mut self) -> EtudeResult<SendStatus> {
        while !self.plan.is_complete() {
            let head = &self.write_buf[self.plan.head_pos..self.plan.head_end];
            let body = match &self.file {
                Some(file) => &file.as_bytes()[self.plan.file_pos..],
                None => &[][..],
            };

            match syscalls::writev_nonblocking(self.fd, &[head, body]) {
                Ok(Some(n)) if n > 0 => self.plan.advance(n),
                // Nothing accepted: treat like would-block and wait for writability
                Ok(Some(_)) | Ok(None) => return Ok(SendStatus::Pending),
                Err(e) => {
                    self.file = None;
                    return Err(e);
                }
            }
        }

        self.file = None;
        if self.keep_alive {
            self.reset();
            Ok(SendStatus::Complete { keep_alive: true })
        } else {
            Ok(SendStatus::Complete { keep_alive: false })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{DocumentRoot, Resolution};
    use libc::c_int;
    use std::fs::{self, Permissions};
    use std::os::fd::RawFd;
    use std::os::unix::fs::PermissionsExt;

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as c_int; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    fn drain(fd: RawFd, out: &mut Vec<u8>) {
        let mut buf = [0u8; 8192];
        while let Ok(Some(n)) = syscalls::read_nonblocking(fd, &mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_plan_advance_spills_into_file() {
        let mut plan = SendPlan::default();
        plan.start(10, 100);
        plan.advance(4);
        assert_eq!((plan.head_pos, plan.file_pos), (4, 0));
        plan.advance(10);
        assert_eq!((plan.head_pos, plan.file_pos), (10, 4));
        plan.advance(96);
        assert!(plan.is_complete());
        assert_eq!(plan.bytes_sent(), plan.bytes_total());
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        let mut conn = Conn::empty();
        conn.init(-1, None);
        assert_eq!(
            conn.attempt_send().unwrap(),
            SendStatus::Complete { keep_alive: false }
        );
    }

    #[test]
    fn test_large_file_resumes_after_would_block() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("big.html"), &content).unwrap();
        fs::set_permissions(dir.path().join("big.html"), Permissions::from_mode(0o644)).unwrap();
        let root = DocumentRoot::new(dir.path());

        let (server, client) = socket_pair();
        let mut conn = Conn::empty();
        conn.init(server, None);
        conn.keep_alive = true;
        conn.build_response(Resolution::locate(&root, "/big.html")).unwrap();
        let head_len = conn.head().len();

        let mut received = Vec::new();
        let mut pending_rounds = 0;
        loop {
            match conn.attempt_send().unwrap() {
                SendStatus::Pending => {
                    pending_rounds += 1;
                    assert!(conn.has_mapping());
                    assert!(conn.plan().bytes_sent() < conn.plan().bytes_total());
                    drain(client, &mut received);
                }
                SendStatus::Complete { keep_alive } => {
                    assert!(keep_alive);
                    break;
                }
            }
        }
        drain(client, &mut received);

        assert!(pending_rounds > 0);
        assert!(!conn.has_mapping());
        assert_eq!(conn.plan().bytes_total(), 0);
        assert_eq!(received.len(), head_len + content.len());
        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(&received[head_len..], &content[..]);

        syscalls::close_fd(server);
        syscalls::close_fd(client);
    }

    #[test]
    fn test_write_error_releases_mapping() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.html"), b"abc").unwrap();
        fs::set_permissions(dir.path().join("a.html"), Permissions::from_mode(0o644)).unwrap();
        syscalls::ignore_sigpipe();
        let root = DocumentRoot::new(dir.path());

        let (server, client) = socket_pair();
        syscalls::close_fd(client);

        let mut conn = Conn::empty();
        conn.init(server, None);
        conn.build_response(Resolution::locate(&root, "/a.html")).unwrap();
        assert!(conn.has_mapping());
        assert!(conn.attempt_send().is_err());
        assert!(!conn.has_mapping());

        syscalls::close_fd(server);
    }
}
