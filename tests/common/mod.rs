//! A plain-http registry stand-in listening on 127.0.0.1.

use std::sync::{Arc, Mutex};

use reqwest::Client;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// A fatal `handshake_failure` alert record.
const TLS_ALERT: &[u8] = &[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x46];

type Responder = dyn Fn(&str, &str) -> (u16, String) + Send + Sync;

pub struct StubRegistry {
    /// `127.0.0.1:<port>`, without a scheme.
    pub addr: String,
    requests: Arc<Mutex<Vec<String>>>,
    server: JoinHandle<()>,
}

impl StubRegistry {
    /// Serves every request with `respond(method, path)`, which returns a status and a body.
    /// TLS connection attempts are hung up on.
    pub async fn start(
        respond: impl Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(Mutex::new(vec![]));
        let respond: Arc<Responder> = Arc::new(respond);

        let server = tokio::spawn({
            let requests = Arc::clone(&requests);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let requests = Arc::clone(&requests);
                    let respond = Arc::clone(&respond);
                    tokio::spawn(async move {
                        let _ = serve(stream, &requests, &*respond).await;
                    });
                }
            }
        });

        StubRegistry {
            addr,
            requests,
            server,
        }
    }

    /// Answers every connection, plain http or not, with a TLS alert.
    #[allow(dead_code)]
    pub async fn start_tls_only() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if stream.read(&mut buf).await.unwrap_or(0) > 0 {
                        let _ = stream.write_all(TLS_ALERT).await;
                    }
                    let _ = stream.shutdown().await;
                });
            }
        });

        StubRegistry {
            addr,
            requests: Arc::default(),
            server,
        }
    }

    /// Every plain http request so far, as `METHOD /path`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubRegistry {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    requests: &Mutex<Vec<String>>,
    respond: &Responder,
) -> std::io::Result<()> {
    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 || first[0] == TLS_HANDSHAKE {
        return Ok(());
    }

    let (read, mut write) = stream.split();
    let mut reader = BufReader::new(read);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 || header == "\r\n" {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    requests.lock().unwrap().push(format!("{method} {path}"));

    let (status, body) = respond(method, path);
    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    write.write_all(response.as_bytes()).await?;
    write.shutdown().await
}

/// A client that ignores proxy settings from the environment.
pub fn client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}
