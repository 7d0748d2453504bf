// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("etude-core drives epoll directly and only builds on Linux");

pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod server;
pub mod slab;
pub mod sync;
pub mod syscalls;
pub mod writer;

// Re-exports for users
pub use config::ServerConfig;
pub use conn::{Conn, Method, Next, ParseState};
pub use error::{EtudeError, EtudeResult};
pub use parser::{LineStatus, ParseOutcome};
pub use pool::WorkerPool;
pub use response::{DocumentRoot, MappedFile, Resolution};
pub use server::{Server, ShutdownHandle};
pub use writer::{SendPlan, SendStatus};
