use clap::Parser;
use etude_core::{Server, ServerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Static file server over HTTP/1.1 with an epoll reactor and a worker pool")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(env = "ETUDE_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "ETUDE_HOST")]
    host: Option<String>,

    /// Directory to serve files from
    #[arg(long, env = "ETUDE_DOC_ROOT")]
    root: Option<PathBuf>,

    /// Worker threads (default: one per CPU)
    #[arg(long, env = "ETUDE_WORKERS")]
    workers: Option<usize>,

    /// Requests that may wait for a worker at once
    #[arg(long, env = "ETUDE_MAX_REQUESTS")]
    max_requests: Option<usize>,

    /// Simultaneously open client connections
    #[arg(long, env = "ETUDE_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        config.port = self.port;
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max_requests) = self.max_requests {
            config.max_requests = max_requests;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    etude_core::logging::init_logging_with_level(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "etude exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> etude_core::EtudeResult<()> {
    let mut config = ServerConfig::from_env()?;
    cli.apply(&mut config);

    let server = Server::bind(config)?;
    server.shutdown_handle().install_signal_handler()?;
    server.serve()
}
