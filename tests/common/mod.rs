//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use roost::lifecycle::Control;
use roost::{ServerInstance, Supervisor, SupervisorError};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Poll until `addr` accepts connections.
pub async fn wait_for_port(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while tokio::net::TcpStream::connect(addr).await.is_err() {
        assert!(Instant::now() < deadline, "{addr} never started listening");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `path` contains `needle`, returning the whole file.
pub async fn wait_for_log(path: &Path, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if content.contains(needle) {
            return content;
        }
        assert!(
            Instant::now() < deadline,
            "{} never contained {needle:?}:\n{content}",
            path.display()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Start a mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { (200, response.to_string()) }).await
}

/// Start a backend that answers every request with `f(request_head)`.
///
/// The request head is everything up to the blank line, so tests can assert
/// on the request line and headers the proxy sent.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = std::sync::Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let head = read_head(&mut socket).await;
                        let (status, body) = f(head).await;
                        let status_text = match status {
                            200 => "200 OK",
                            201 => "201 Created",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nX-Backend: mock\r\n\
                             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// An in-process supervisor serving from a temporary prefix.
pub struct Running {
    pub dir: TempDir,
    pub conf: PathBuf,
    pub addr: SocketAddr,
    controls: mpsc::Sender<Control>,
    task: JoinHandle<(Supervisor, Result<(), SupervisorError>)>,
}

impl Running {
    /// Write `yaml` (with `{port}` replaced by a free port) and serve it.
    pub async fn start(servers: Vec<ServerInstance>, yaml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let conf = dir.path().join("roost.yaml");
        std::fs::write(&conf, yaml.replace("{port}", &port.to_string())).unwrap();

        let mut supervisor = Supervisor::new(servers).with_prefix(dir.path());
        let (controls, rx) = mpsc::channel(4);
        let serve_conf = conf.clone();
        let task = tokio::spawn(async move {
            let result = supervisor.serve(&serve_conf, rx).await;
            (supervisor, result)
        });

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        wait_for_port(addr).await;
        Self {
            dir,
            conf,
            addr,
            controls,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn rewrite_config(&self, yaml: &str) {
        let port = self.addr.port().to_string();
        std::fs::write(&self.conf, yaml.replace("{port}", &port)).unwrap();
    }

    pub async fn reload(&self) {
        self.controls.send(Control::Reload).await.unwrap();
    }

    /// Stop and wait for the supervisor to return.
    pub async fn stop(self) -> (TempDir, Supervisor, Result<(), SupervisorError>) {
        self.controls.send(Control::Stop).await.unwrap();
        let (supervisor, result) = tokio::time::timeout(Duration::from_secs(30), self.task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        (self.dir, supervisor, result)
    }
}
