//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 requests and hands each one to a
//! [`Stage`] as an [`Environment`]. Stages are synchronous, so every call runs
//! on Tokio's blocking pool; the response body is drained there as well.
//! HTTP/1.1 persistent connections (keep-alive) are supported.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Stage;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The croon HTTP server.
///
/// Binds to a TCP address and serves a [`Stage`].
///
/// # Examples
///
/// ```rust,no_run
/// use croon::app::App;
/// use croon::handler::Signal;
/// use croon::middleware::Logger;
/// use croon::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut app = App::new();
///     app.get("/", |_| Ok(Signal::body("Hello!")))?;
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(Logger::new(app.build())).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and serving them with `stage`.
    ///
    /// The stage is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks. This method runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<S>(self, stage: S) -> Result<(), ServerError>
    where
        S: Stage + 'static,
    {
        let stage = Arc::new(stage);
        info!(address = %self.local_addr, "croon listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let stage = Arc::clone(&stage);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, stage).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<S>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stage: Arc<S>,
) -> Result<(), std::io::Error>
where
    S: Stage + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                .body("Request entity too large");
            stream.write_all(&response.into_bytes(false)).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"));
                stream.write_all(&response.into_bytes(false)).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        let keep_alive = request.is_keep_alive();
        let mut env = request.into_environment(content_length);
        env.insert_var("remote_addr", peer_addr.to_string());

        debug!(
            peer = %peer_addr,
            method = %env.method(),
            path = env.path(),
            "dispatching request"
        );

        let stage = Arc::clone(&stage);
        let wire = tokio::task::spawn_blocking(move || stage.call(env).into_bytes(keep_alive))
            .await
            .unwrap_or_else(|e| {
                error!(peer = %peer_addr, error = %e, "stage panicked");
                Response::new(StatusCode::INTERNAL_SERVER_ERROR).into_bytes(false)
            });

        stream.write_all(&wire).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::handler::Signal;

    async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn serves_an_application() {
        let mut app = App::new();
        app.set("environment", "test");
        app.post("/echo/:word", |ctx| {
            let word = ctx.param("word").unwrap_or_default().to_owned();
            let note = ctx.param("note").unwrap_or_default().to_owned();
            Ok(Signal::body(format!("{word}/{note}")))
        })
        .unwrap();

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(app.build()));

        let body = "note=hi";
        let raw = format!(
            "POST /echo/hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let response = roundtrip(addr, raw.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html;charset=utf-8\r\n"));
        assert!(response.ends_with("\r\n\r\nhello/hi"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|_env: crate::http::Environment| Response::new(StatusCode::OK)));

        let response = roundtrip(addr, b"NOT A REQUEST\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn bind_error_names_the_address() {
        let err = Server::bind("not-an-address").await.err().unwrap();
        assert!(err.to_string().contains("not-an-address"));
    }
}
