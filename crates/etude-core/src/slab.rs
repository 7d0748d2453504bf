// src/slab.rs
use crate::conn::Conn;
use crate::context::ServerContext;
use crate::error::{EtudeError, EtudeResult};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Names a connection slot. This is what travels through the worker queue; the table
/// keeps ownership of the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(RawFd);

impl ConnHandle {
    #[inline]
    pub fn fd(self) -> RawFd {
        self.0
    }

    /// epoll token carried by the descriptor's registration.
    #[inline]
    pub fn from_token(token: u64) -> Self {
        Self(token as RawFd)
    }
}

/// Fixed-capacity table of connections indexed by descriptor.
///
/// A slot's mutex is an exclusive-access token rather than a point of contention: with
/// one-shot registration only the thread that received the last readiness event (or the
/// worker it handed the connection to) ever touches a given slot.
pub struct ConnectionTable {
    slots: Box<[Mutex<Option<Box<Conn>>>]>,
}

impl ConnectionTable {
    /// Slots start empty; a `Conn` is allocated the first time a descriptor lands on a
    /// slot and reused from then on.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: RawFd) -> Option<MutexGuard<'_, Option<Box<Conn>>>> {
        let idx = usize::try_from(fd).ok()?;
        let slot = self.slots.get(idx)?;
        Some(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Initialise the slot for a newly accepted socket and count it as live.
    pub fn open(
        &self,
        ctx: &ServerContext,
        fd: RawFd,
        peer: Option<SocketAddr>,
    ) -> EtudeResult<ConnHandle> {
        let mut slot = self.slot(fd).ok_or(EtudeError::TableFull)?;
        let conn = slot.get_or_insert_with(|| Box::new(Conn::empty()));
        conn.init(fd, peer);
        ctx.connection_opened();
        Ok(ConnHandle(fd))
    }

    /// Run `f` against the open connection behind `handle`. `None` if the slot is
    /// free or holds a different connection.
    pub fn with<R>(&self, handle: ConnHandle, f: impl FnOnce(&mut Conn) -> R) -> Option<R> {
        let mut slot = self.slot(handle.0)?;
        let conn = slot.as_deref_mut()?;
        if !conn.is_open() || conn.fd() != handle.0 {
            return None;
        }
        Some(f(conn))
    }

    /// Tear down every open connection. Used once the reactor and workers have stopped.
    pub fn close_all(&self, ctx: &ServerContext) {
        for slot in self.slots.iter() {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(conn) = slot.as_deref_mut() {
                conn.close(ctx);
            }
        }
    }
}
