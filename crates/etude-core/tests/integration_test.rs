use etude_core::{EtudeResult, Server, ServerConfig, ShutdownHandle};
use std::fs::{self, Permissions};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

const INDEX: &[u8] = b"<html><body>hello from etude</body></html>\n";

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<EtudeResult<()>>>,
    _root: TempDir,
}

impl TestServer {
    fn start(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        publish(&root, "index.html", INDEX);
        let big: Vec<u8> = (0..1024 * 1024).map(|i| (i % 253) as u8).collect();
        publish(&root, "big.html", &big);
        fs::write(root.path().join("secret.html"), b"hidden").unwrap();
        fs::set_permissions(root.path().join("secret.html"), Permissions::from_mode(0o600))
            .unwrap();

        let mut config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            doc_root: root.path().to_path_buf(),
            workers: 2,
            max_requests: 64,
            max_connections: 64,
            max_events: 128,
        };
        configure(&mut config);

        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || server.serve());

        // Give the reactor time to register the listener
        thread::sleep(Duration::from_millis(50));

        Self {
            addr,
            shutdown,
            thread: Some(thread),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn stop(mut self) {
        self.shutdown.shutdown();
        let result = self.thread.take().unwrap().join().unwrap();
        assert!(result.is_ok(), "serve failed: {:?}", result);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.shutdown();
            let _ = thread.join();
        }
    }
}

fn publish(root: &TempDir, name: &str, content: &[u8]) {
    let path = root.path().join(name);
    fs::write(&path, content).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
}

/// Read exactly one response: the head up to the blank line, then Content-Length bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed inside the response head");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("response carries a Content-Length")
        .trim()
        .parse()
        .unwrap();

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();

    for _ in 0..2 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, INDEX);
    }

    server.stop();
}

#[test]
fn test_missing_file_gets_404_and_close() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.ends_with("The requested file was not found on this server.\n"));

    server.stop();
}

#[test]
fn test_unreadable_file_gets_403() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"GET /secret.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(!res.contains("hidden"));

    server.stop();
}

#[test]
fn test_post_is_bad_request() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"POST /index.html HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(res.contains("Connection: close\r\n"));

    server.stop();
}

#[test]
fn test_request_trickled_byte_by_byte() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();

    for &b in b"GET http://localhost/index.html HTTP/1.1\r\nHost: localhost\r\n\r\n".iter() {
        stream.write_all(&[b]).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, INDEX);

    server.stop();
}

#[test]
fn test_large_file_arrives_intact() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"GET /big.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();

    // Let the send hit a full socket buffer before draining
    thread::sleep(Duration::from_millis(100));
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body.len(), 1024 * 1024);
    assert!(body.iter().enumerate().all(|(i, &b)| b == (i % 253) as u8));

    // The connection is ready for another exchange afterwards
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, INDEX);

    server.stop();
}

#[test]
fn test_connection_limit_refuses_extra_clients() {
    let server = TestServer::start(|config| config.max_connections = 1);

    let mut first = server.connect();
    thread::sleep(Duration::from_millis(100));

    let mut second = server.connect();
    let mut buf = Vec::new();
    match second.read_to_end(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "refused client must not get a response"),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock, "refused client hung"),
    }

    // The admitted client is still served
    first
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, INDEX);

    server.stop();
}
