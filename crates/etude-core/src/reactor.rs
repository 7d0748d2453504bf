// src/reactor.rs
use crate::conn::{Conn, Next};
use crate::context::{Interest, ServerContext};
use crate::error::EtudeResult;
use crate::pool::WorkerPool;
use crate::slab::{ConnHandle, ConnectionTable};
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

pub const LISTENER_TOKEN: u64 = u64::MAX;
pub const WAKER_TOKEN: u64 = u64::MAX - 1;

/// Run one handler step against a connection, then re-arm or tear it down.
///
/// The slot is released before the descriptor is re-armed, so the next readiness event
/// always finds the connection free.
pub fn drive(
    ctx: &ServerContext,
    table: &ConnectionTable,
    handle: ConnHandle,
    step: impl FnOnce(&mut Conn) -> Next,
) {
    let next = table.with(handle, |conn| {
        let next = step(conn);
        if next == Next::Close {
            conn.close(ctx);
        }
        next
    });

    let interest = match next {
        Some(Next::Read) => Interest::Read,
        Some(Next::Write) => Interest::Write,
        Some(Next::Close) | None => return,
    };

    if let Err(e) = ctx.rearm(handle.fd(), interest) {
        warn!(fd = handle.fd(), error = %e, "re-arm failed");
        table.with(handle, |conn| conn.close(ctx));
    }
}

/// Single-threaded readiness loop: accepts clients, drains reads inline, hands parsing
/// to the worker pool and resumes pending writes itself.
pub struct Reactor<'a> {
    ctx: &'a ServerContext,
    table: &'a ConnectionTable,
    pool: &'a WorkerPool<ConnHandle>,
    listen_fd: RawFd,
    waker_fd: RawFd,
    shutdown: &'a AtomicBool,
    events: Vec<epoll_event>,
}

impl<'a> Reactor<'a> {
    /// Registers the listener and the wake-up pipe with the shared epoll instance.
    pub fn new(
        ctx: &'a ServerContext,
        table: &'a ConnectionTable,
        pool: &'a WorkerPool<ConnHandle>,
        listen_fd: RawFd,
        waker_fd: RawFd,
        shutdown: &'a AtomicBool,
        max_events: usize,
    ) -> EtudeResult<Self> {
        ctx.epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;
        ctx.epoll.add(waker_fd, WAKER_TOKEN, EPOLLIN)?;
        Ok(Self {
            ctx,
            table,
            pool,
            listen_fd,
            waker_fd,
            shutdown,
            events: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Loop until shutdown is requested. A failing `epoll_wait` (other than EINTR) is
    /// fatal and ends the loop with the error.
    pub fn run(&mut self) -> EtudeResult<()> {
        info!(listen_fd = self.listen_fd, "reactor entering event loop");

        while !self.shutdown.load(Ordering::Acquire) {
            let n = match self.ctx.epoll.wait(&mut self.events, -1) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed");
                    return Err(e);
                }
            };

            for i in 0..n {
                let event = self.events[i];
                let token = event.u64;
                let flags = event.events as i32;

                match token {
                    LISTENER_TOKEN => self.accept_all(),
                    WAKER_TOKEN => syscalls::drain_pipe(self.waker_fd),
                    _ => self.dispatch(ConnHandle::from_token(token), flags),
                }
            }
        }

        info!("reactor stopped");
        Ok(())
    }

    /// The listener is edge triggered, so drain the whole backlog.
    fn accept_all(&self) {
        loop {
            let (fd, peer) = match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };

            if self.ctx.at_capacity() {
                warn!(
                    fd,
                    live = self.ctx.live_connections(),
                    "connection limit reached, refusing client"
                );
                syscalls::close_fd(fd);
                continue;
            }

            let handle = match self.table.open(self.ctx, fd, peer) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(fd, error = %e, "no slot for client");
                    syscalls::close_fd(fd);
                    continue;
                }
            };

            if let Err(e) = self.ctx.register(fd, Interest::Read) {
                warn!(fd, error = %e, "epoll registration failed");
                self.close(handle);
                continue;
            }
            debug!(fd, peer = ?peer, "accepted connection");
        }
    }

    fn dispatch(&self, handle: ConnHandle, flags: i32) {
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            debug!(fd = handle.fd(), flags, "peer hung up");
            self.close(handle);
        } else if flags & EPOLLIN != 0 {
            match self.table.with(handle, |conn| conn.read_once()) {
                Some(true) => {
                    if let Err(e) = self.pool.submit(handle) {
                        warn!(
                            fd = handle.fd(),
                            queued = self.pool.len(),
                            capacity = self.pool.capacity(),
                            error = %e,
                            "dropping request"
                        );
                        self.close(handle);
                    }
                }
                Some(false) => self.close(handle),
                None => {}
            }
        } else if flags & EPOLLOUT != 0 {
            drive(self.ctx, self.table, handle, Conn::write);
        }
    }

    fn close(&self, handle: ConnHandle) {
        self.table.with(handle, |conn| conn.close(self.ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::DocumentRoot;
    use crate::syscalls::Epoll;
    use libc::c_int;

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

    /// Ready events right now, as (token, flags).
    fn poll(ctx: &ServerContext) -> Vec<(u64, i32)> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];
        let n = ctx.epoll.wait(&mut events, 0).unwrap();
        events[..n]
            .iter()
            .map(|ev| {
                let ev = *ev;
                (ev.u64, ev.events as i32)
            })
            .collect()
    }

    #[test]
    fn test_one_delivery_per_arm() {
        let ctx = ServerContext::new(Epoll::new().unwrap(), DocumentRoot::new("."), 8);
        let table = ConnectionTable::new(4096);
        let (server, client) = socket_pair();
        let handle = table.open(&ctx, server, None).unwrap();
        ctx.register(server, Interest::Read).unwrap();

        syscalls::writev_nonblocking(client, &[b"GET"]).unwrap();
        let events = poll(&ctx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, server as u64);
        assert_ne!(events[0].1 & EPOLLIN, 0);

        // Disarmed until a handler step finishes, whatever else arrives
        syscalls::writev_nonblocking(client, &[b" /"]).unwrap();
        assert!(poll(&ctx).is_empty());

        // Re-armed for read with data still unread: exactly one more delivery
        drive(&ctx, &table, handle, |_| Next::Read);
        let events = poll(&ctx);
        assert_eq!(events.len(), 1);
        assert_ne!(events[0].1 & EPOLLIN, 0);
        assert!(poll(&ctx).is_empty());

        // Re-armed for write on a writable socket: one delivery, then silence
        drive(&ctx, &table, handle, |_| Next::Write);
        let events = poll(&ctx);
        assert_eq!(events.len(), 1);
        assert_ne!(events[0].1 & EPOLLOUT, 0);
        assert!(poll(&ctx).is_empty());

        // Close never re-arms and frees the slot
        drive(&ctx, &table, handle, |_| Next::Close);
        assert!(poll(&ctx).is_empty());
        assert_eq!(ctx.live_connections(), 0);
        assert_eq!(table.with(handle, |_| ()), None);

        syscalls::close_fd(client);
    }

    #[test]
    fn test_drive_on_free_slot_does_nothing() {
        let ctx = ServerContext::new(Epoll::new().unwrap(), DocumentRoot::new("."), 8);
        let table = ConnectionTable::new(16);
        let mut ran = false;
        drive(&ctx, &table, ConnHandle::from_token(3), |_| {
            ran = true;
            Next::Read
        });
        assert!(!ran);
        assert_eq!(ctx.live_connections(), 0);
    }
}
