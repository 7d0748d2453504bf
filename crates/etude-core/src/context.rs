// src/context.rs
use crate::error::EtudeResult;
use crate::response::DocumentRoot;
use crate::syscalls::{EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Readiness a connection descriptor is armed for. Every arm is one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn events(self) -> i32 {
        let base = EPOLLRDHUP | EPOLLONESHOT;
        match self {
            Interest::Read => base | EPOLLIN,
            Interest::Write => base | EPOLLOUT,
        }
    }
}

/// State shared by the reactor and every worker, created once at startup.
pub struct ServerContext {
    pub epoll: Epoll,
    pub doc_root: DocumentRoot,
    max_connections: usize,
    live: AtomicUsize,
}

impl ServerContext {
    pub fn new(epoll: Epoll, doc_root: DocumentRoot, max_connections: usize) -> Self {
        Self {
            epoll,
            doc_root,
            max_connections,
            live: AtomicUsize::new(0),
        }
    }

    /// First registration of a freshly accepted socket.
    pub fn register(&self, fd: RawFd, interest: Interest) -> EtudeResult<()> {
        self.epoll.add(fd, fd as u64, interest.events())
    }

    /// Hand the descriptor back to epoll for exactly one more readiness delivery.
    pub fn rearm(&self, fd: RawFd, interest: Interest) -> EtudeResult<()> {
        self.epoll.modify(fd, fd as u64, interest.events())
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn at_capacity(&self) -> bool {
        self.live_connections() >= self.max_connections
    }

    pub(crate) fn connection_opened(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_closed(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
