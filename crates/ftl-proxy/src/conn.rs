use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::swap::SwapTable;
use crate::tls::ProxyCa;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const RELAY_CHUNK: usize = 64 * 1024;

/// Headers owned by the proxy hop, never forwarded upstream.
const HOP_HEADERS: &[&str] = &["host", "connection", "proxy-connection", "content-length"];

/// Shared per-proxy state handed to every connection task.
pub struct ProxyState {
    pub swap: Arc<SwapTable>,
    pub ca: Arc<ProxyCa>,
    pub http: reqwest::Client,
    pub upstream_tls: TlsConnector,
}

/// One parsed HTTP/1.1 request head.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Handle one accepted client connection. Errors terminate only this
/// connection; they never reach the session that owns the proxy.
pub async fn handle_connection(stream: TcpStream, state: Arc<ProxyState>) {
    let mut io = BufReader::new(stream);
    let head = match read_head(&mut io).await {
        Ok(Some(head)) => head,
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "Failed to parse request head");
            return;
        }
    };

    let result = if head.method == "CONNECT" {
        handle_connect(io, &head, &state).await
    } else {
        forward_plain(io, &head, &state).await
    };
    if let Err(e) = result {
        debug!(method = %head.method, target = %head.target, error = %e, "Connection ended with error");
    }
}

/// Read the request line and headers up to the blank line.
pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<RequestHead>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().context("missing method")?.to_string();
    let target = parts.next().context("missing request target")?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

// ---------------------------------------------------------------------------
// Plain HTTP
// ---------------------------------------------------------------------------

/// Forward a non-CONNECT request, swapping credentials in headers and body.
async fn forward_plain<S>(mut io: S, head: &RequestHead, state: &ProxyState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let content_length: usize = head
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        io.read_exact(&mut body).await?;
    }
    let body = state.swap.swap_bytes(&body);

    let url = if head.target.starts_with("http") {
        head.target.clone()
    } else {
        let host = head.header("host").unwrap_or_default();
        format!("http://{}{}", host, head.target)
    };

    let method = reqwest::Method::from_bytes(head.method.as_bytes())
        .with_context(|| format!("Bad method {:?}", head.method))?;
    let mut request = state.http.request(method, &url);
    for (name, value) in &head.headers {
        if HOP_HEADERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        request = request.header(name.as_str(), state.swap.swap_str(value));
    }
    // reqwest recomputes Content-Length from the post-swap body.
    request = request.body(body);

    match request.send().await {
        Ok(response) => write_response(&mut io, response).await,
        Err(e) => write_502(&mut io, &e.to_string()).await,
    }
}

/// Mirror an upstream response back to the client.
///
/// Transfer-Encoding is dropped (the body is already de-chunked) and
/// Content-Length recomputed; the connection closes after one exchange.
async fn write_response<S>(io: &mut S, response: reqwest::Response) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        let lower = name.as_str().to_lowercase();
        if lower == "transfer-encoding" || lower == "content-length" || lower == "connection" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    let body = response.bytes().await.unwrap_or_default();
    head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));

    io.write_all(head.as_bytes()).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

async fn write_502<S>(io: &mut S, detail: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!("Bad Gateway: {}", detail);
    let head = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    io.write_all(head.as_bytes()).await?;
    io.write_all(body.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTPS (CONNECT)
// ---------------------------------------------------------------------------

/// MITM a CONNECT tunnel: fake the server towards the client with a leaf
/// signed by the session CA, speak real TLS to the upstream, and swap
/// credential bytes on the client→upstream direction.
async fn handle_connect<S>(mut io: S, head: &RequestHead, state: &ProxyState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_host_port(&head.target);

    // The tunnel is reported open before any TLS work; the handshake that
    // follows is what the client perceives as the remote server.
    io.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    io.flush().await?;

    let server_config = state.ca.server_config_for(&host)?;
    let acceptor = TlsAcceptor::from(server_config);
    let client_tls = acceptor
        .accept(io)
        .await
        .context("Client TLS handshake failed")?;

    let upstream_tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| anyhow::anyhow!("Upstream connect timed out"))?
        .with_context(|| format!("Upstream connect failed: {}:{}", host, port))?;

    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .with_context(|| format!("Invalid upstream server name: {}", host))?;
    let upstream_tls = tokio::time::timeout(
        CONNECT_TIMEOUT,
        state.upstream_tls.connect(server_name, upstream_tcp),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Upstream TLS handshake timed out"))?
    .context("Upstream TLS handshake failed")?;

    relay(client_tls, upstream_tls, &state.swap).await;
    Ok(())
}

/// `host:port` with a 443 default, tolerating a bare host.
pub fn split_host_port(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), 443),
        },
        None => (target.to_string(), 443),
    }
}

enum RelayEvent {
    Client(std::io::Result<usize>),
    Upstream(std::io::Result<usize>),
}

/// Bidirectional byte relay with swapping on the client→upstream leg.
///
/// Ends when either side closes or errors, or after 120 s of mutual
/// silence. Both sockets are closed on exit (dropped halves).
async fn relay<C, U>(client: C, upstream: U, swap: &SwapTable)
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let mut client_buf = vec![0u8; RELAY_CHUNK];
    let mut upstream_buf = vec![0u8; RELAY_CHUNK];

    loop {
        let event = tokio::time::timeout(RELAY_IDLE_TIMEOUT, async {
            tokio::select! {
                r = client_rd.read(&mut client_buf) => RelayEvent::Client(r),
                r = upstream_rd.read(&mut upstream_buf) => RelayEvent::Upstream(r),
            }
        })
        .await;

        match event {
            Err(_) => break, // idle timeout
            Ok(RelayEvent::Client(Ok(0))) | Ok(RelayEvent::Upstream(Ok(0))) => break,
            Ok(RelayEvent::Client(Err(_))) | Ok(RelayEvent::Upstream(Err(_))) => break,
            Ok(RelayEvent::Client(Ok(n))) => {
                let data = swap.swap_bytes(&client_buf[..n]);
                if upstream_wr.write_all(&data).await.is_err() {
                    break;
                }
            }
            Ok(RelayEvent::Upstream(Ok(n))) => {
                if client_wr.write_all(&upstream_buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_head() {
        let raw = b"POST /charge HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/charge");
        assert_eq!(head.header("host"), Some("api.example.com"));
        assert_eq!(head.header("HOST"), Some("api.example.com"));
        assert_eq!(head.header("content-length"), Some("5"));

        let mut body = vec![0u8; 5];
        reader.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_head(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("api.stripe.com:443"), ("api.stripe.com".to_string(), 443));
        assert_eq!(split_host_port("example.com:8443"), ("example.com".to_string(), 8443));
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), 443));
    }
}
