#![allow(dead_code)]

//! In-process relay server: accepts WebSocket channels under `/ws/...` and
//! serves `multipart/x-mixed-replace` streams under `/mjpeg/...`, both on
//! one port. Each accepted connection is handed to the test as a
//! [`MockChannel`] it can push frames through.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

pub const MJPEG_BOUNDARY: &str = "frame";

enum Outbound {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// One accepted client connection.
pub struct MockChannel {
    /// Request path and query, e.g. `/ws/video/client/r1`.
    pub target: String,
    received_rx: mpsc::Receiver<String>,
    outbound_tx: mpsc::Sender<Outbound>,
}

impl MockChannel {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn is_mjpeg(&self) -> bool {
        self.target.starts_with("/mjpeg")
    }

    /// A binary WebSocket message, or one multipart part for MJPEG.
    pub async fn send_frame(&self, bytes: &[u8]) {
        self.outbound_tx
            .send(Outbound::Binary(bytes.to_vec()))
            .await
            .expect("mock channel task stopped");
    }

    pub async fn send_text(&self, text: &str) {
        self.outbound_tx
            .send(Outbound::Text(text.to_string()))
            .await
            .expect("mock channel task stopped");
    }

    /// Next text message the client sent.
    pub async fn recv_text(&mut self) -> String {
        timeout(STEP_TIMEOUT, self.received_rx.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("mock channel closed")
    }

    /// Resolves once the client side has gone away.
    pub async fn wait_closed(&mut self) {
        timeout(STEP_TIMEOUT, async {
            while self.received_rx.recv().await.is_some() {}
        })
        .await
        .expect("timed out waiting for client to close");
    }

    /// Close from the server side.
    pub async fn close(&self) {
        let _ = self.outbound_tx.send(Outbound::Close).await;
    }
}

pub struct MockRobotServer {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockChannel>,
    server_task: JoinHandle<()>,
}

impl MockRobotServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);

        let server_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let connection_tx = connection_tx.clone();
                tokio::spawn(async move {
                    let Some(target) = peek_target(&stream).await else {
                        return;
                    };
                    if target.starts_with("/ws/") {
                        serve_socket(stream, target, connection_tx).await;
                    } else if target.starts_with("/mjpeg") {
                        serve_mjpeg(stream, target, connection_tx).await;
                    } else {
                        let mut stream = stream;
                        let _ = stream
                            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                            .await;
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            server_task,
        })
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn accept(&mut self) -> MockChannel {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock server connection channel closed")
    }

    /// Accept `count` connections, in whatever order they arrive.
    pub async fn accept_many(&mut self, count: usize) -> Channels {
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            channels.push(self.accept().await);
        }
        Channels(channels)
    }

    pub async fn try_accept(&mut self, wait: Duration) -> Option<MockChannel> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(channel)) => Some(channel),
            _ => None,
        }
    }
}

impl Drop for MockRobotServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

/// Accepted channels, looked up by path prefix.
pub struct Channels(pub Vec<MockChannel>);

impl Channels {
    pub fn take(&mut self, prefix: &str) -> MockChannel {
        let index = self
            .0
            .iter()
            .position(|c| c.target.starts_with(prefix))
            .unwrap_or_else(|| panic!("no channel accepted under {prefix}"));
        self.0.remove(index)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.0.iter().map(|c| c.path().to_string()).collect();
        paths.sort();
        paths
    }
}

/// Request target from the request line, without consuming it.
async fn peek_target(stream: &TcpStream) -> Option<String> {
    let mut buf = [0u8; 1024];
    for _ in 0..200 {
        let n = stream.peek(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        let head = String::from_utf8_lossy(&buf[..n]);
        if let Some(line) = head.split("\r\n").next().filter(|_| head.contains("\r\n")) {
            return line.split_whitespace().nth(1).map(str::to_string);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

async fn serve_socket(stream: TcpStream, target: String, connection_tx: mpsc::Sender<MockChannel>) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut ws_sink, mut ws_source) = ws_stream.split();
    let (received_tx, received_rx) = mpsc::channel(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);

    let channel = MockChannel {
        target,
        received_rx,
        outbound_tx,
    };
    if connection_tx.send(channel).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let message = match outbound {
                    Some(Outbound::Binary(bytes)) => Message::Binary(bytes.into()),
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    Some(Outbound::Close) => {
                        let _ = ws_sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "robot left".into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                };
                if ws_sink.send(message).await.is_err() {
                    break;
                }
            }
            incoming = ws_source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = received_tx.send(text.as_str().to_string()).await;
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn serve_mjpeg(
    mut stream: TcpStream,
    target: String,
    connection_tx: mpsc::Sender<MockChannel>,
) {
    // Consume the request head; GET has no body.
    let mut head = Vec::new();
    let mut buf = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }

    let response_head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\r\n"
    );
    if stream.write_all(response_head.as_bytes()).await.is_err() {
        return;
    }

    let (received_tx, received_rx) = mpsc::channel(1);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let channel = MockChannel {
        target,
        received_rx,
        outbound_tx,
    };
    if connection_tx.send(channel).await.is_err() {
        return;
    }

    // Held so `wait_closed` resolves only when this task ends.
    let _received_tx: mpsc::Sender<String> = received_tx;
    let (mut reader, mut writer) = stream.into_split();
    let mut sink = [0u8; 64];
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Binary(bytes)) => {
                    let part_head = format!(
                        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        bytes.len()
                    );
                    let written = async {
                        writer.write_all(part_head.as_bytes()).await?;
                        writer.write_all(&bytes).await?;
                        writer.write_all(b"\r\n").await?;
                        writer.flush().await
                    };
                    if written.await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Text(_)) => {}
                Some(Outbound::Close) | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },
            read = reader.read(&mut sink) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
