/*!
 * Minimal HTTP/1.1 server streaming a known byte pattern, for tests.
 */

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone)]
pub(crate) enum Body {
    /** Never ends: writes `block` bytes every `interval` until the client leaves. */
    Endless { block: usize, interval: Duration },
    /** Sends these bytes, then closes the connection. */
    Finite(Vec<u8>),
    /** Promises `declared` bytes, sends `data`, then closes the connection. */
    Truncated { declared: usize, data: Vec<u8> },
    /** Answers with this status and an empty body. */
    Status(u16),
    /** Reads the request and never answers. */
    Silent,
}

impl Body {
    pub(crate) fn endless() -> Self {
        Body::Endless {
            block: 512,
            interval: Duration::from_millis(5),
        }
    }
}

/** Byte `i` of every stream served here. */
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub(crate) struct TestServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub(crate) fn url(&self) -> String {
        format!("http://{}/live.mp3", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) async fn spawn(body: Body) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, body.clone()));
        }
    });
    TestServer { addr, handle }
}

/** A URL on a port nothing listens on. */
pub(crate) async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/live.mp3", addr)
}

async fn serve(mut socket: TcpStream, body: Body) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }

    match body {
        Body::Endless { block, interval } => {
            let header = "HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nConnection: close\r\n\r\n";
            if socket.write_all(header.as_bytes()).await.is_err() {
                return;
            }
            let mut offset = 0;
            loop {
                let data: Vec<u8> = (offset..offset + block).map(|i| (i % 251) as u8).collect();
                if socket.write_all(&data).await.is_err() {
                    return;
                }
                offset += block;
                tokio::time::sleep(interval).await;
            }
        }
        Body::Finite(data) => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                data.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(&data).await;
            let _ = socket.shutdown().await;
        }
        Body::Truncated { declared, data } => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                declared
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(&data).await;
            let _ = socket.shutdown().await;
        }
        Body::Status(code) => {
            let header = format!(
                "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code
            );
            let _ = socket.write_all(header.as_bytes()).await;
        }
        Body::Silent => std::future::pending::<()>().await,
    }
}
