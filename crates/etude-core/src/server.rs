// src/server.rs
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::EtudeResult;
use crate::pool::WorkerPool;
use crate::reactor::{self, Reactor};
use crate::response::DocumentRoot;
use crate::slab::{ConnHandle, ConnectionTable};
use crate::syscalls::{self, Epoll};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::info;

/// The table is indexed by descriptor number, so it needs room for the descriptors the
/// process holds besides its clients.
const FD_HEADROOM: usize = 64;
const MIN_TABLE_SLOTS: usize = 4096;

struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Drop for Waker {
    fn drop(&mut self) {
        syscalls::close_fd(self.read_fd);
        syscalls::close_fd(self.write_fd);
    }
}

struct ShutdownState {
    flag: AtomicBool,
    waker: Waker,
}

/// Stops a running server from any thread (or from a signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    /// Set the stop flag and wake the reactor out of `epoll_wait`.
    pub fn shutdown(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        syscalls::wake_pipe(self.state.waker.write_fd);
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }

    /// Route Ctrl-C to [`ShutdownHandle::shutdown`]. Only one handler can be installed
    /// per process.
    pub fn install_signal_handler(&self) -> EtudeResult<()> {
        let handle = self.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            handle.shutdown();
        })?;
        Ok(())
    }
}

pub struct Server {
    config: ServerConfig,
    listen_fd: RawFd,
    state: Arc<ShutdownState>,
}

impl Server {
    /// Validate `config` and bind its listening socket.
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;
        let listen_fd = syscalls::create_listen_socket(&config.host, config.port)?;
        Self::from_listener(listen_fd, config)
    }

    /// Take ownership of an already listening, non-blocking socket. The descriptor is
    /// closed when the server is dropped, or right away if construction fails.
    pub fn from_listener(listen_fd: RawFd, config: ServerConfig) -> EtudeResult<Self> {
        let pipe = config.validate().and_then(|_| syscalls::create_pipe());
        let (read_fd, write_fd) = match pipe {
            Ok(fds) => fds,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };

        Ok(Self {
            config,
            listen_fd,
            state: Arc::new(ShutdownState {
                flag: AtomicBool::new(false),
                waker: Waker { read_fd, write_fd },
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        syscalls::local_addr(self.listen_fd)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Run the reactor on the calling thread and the worker pool beside it until a
    /// [`ShutdownHandle`] stops the server or `epoll_wait` fails.
    pub fn serve(self) -> EtudeResult<()> {
        syscalls::ignore_sigpipe();

        let config = &self.config;
        let ctx = ServerContext::new(
            Epoll::new()?,
            DocumentRoot::new(&config.doc_root),
            config.max_connections,
        );
        let table = ConnectionTable::new(table_capacity(config.max_connections));
        let pool = WorkerPool::new(config.workers, config.max_requests)?;
        let handler = |handle: ConnHandle| {
            reactor::drive(&ctx, &table, handle, |conn| conn.process(&ctx.doc_root));
        };

        info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| config.server_addr()),
            root = %config.doc_root.display(),
            workers = pool.workers(),
            max_connections = config.max_connections,
            "etude listening"
        );

        let result = thread::scope(|scope| {
            if let Err(e) = pool.spawn_workers(scope, &handler) {
                pool.shutdown();
                return Err(e);
            }

            let result = Reactor::new(
                &ctx,
                &table,
                &pool,
                self.listen_fd,
                self.state.waker.read_fd,
                &self.state.flag,
                config.max_events,
            )
            .and_then(|mut reactor| reactor.run());

            pool.shutdown();
            result
        });

        table.close_all(&ctx);
        info!(live = ctx.live_connections(), "server stopped");
        result
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}

fn table_capacity(max_connections: usize) -> usize {
    max_connections.saturating_add(FD_HEADROOM).max(MIN_TABLE_SLOTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EtudeError;

    #[test]
    fn test_table_leaves_room_for_other_descriptors() {
        assert_eq!(table_capacity(65_535), 65_599);
        assert_eq!(table_capacity(2), MIN_TABLE_SLOTS);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let fd = syscalls::create_listen_socket("127.0.0.1", 0).unwrap();
        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(Server::from_listener(fd, config), Err(EtudeError::Config(_))));
    }

    #[test]
    fn test_shutdown_before_serve_returns() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).unwrap();
        let handle = server.shutdown_handle();
        handle.shutdown();
        assert!(handle.is_shutdown());
        server.serve().unwrap();
    }
}
