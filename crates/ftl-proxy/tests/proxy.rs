//! End-to-end proxy tests: a capturing upstream server records exactly what
//! it received, so the swap can be asserted on the wire rather than on the
//! proxy's own internals.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ftl_proxy::CredentialSwapProxy;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const SHADOW: &str = "ftl_shadow_stripe_secret_key_deadbeefdeadbeef";
const REAL: &str = "sk_live_abc123_real_key";

fn swap_table() -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    table.insert(SHADOW.to_string(), REAL.to_string());
    table
}

#[derive(Debug, Clone, Default)]
struct Hit {
    auth: String,
    body: String,
}

type Hits = Arc<Mutex<Vec<Hit>>>;

/// Serve one HTTP request from any AsyncRead+AsyncWrite, recording the
/// Authorization header and body.
async fn capture_one<S>(stream: S, hits: Hits)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();

    let mut auth = String::new();
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).await.unwrap();
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            match name.trim().to_lowercase().as_str() {
                "authorization" => auth = value.trim().to_string(),
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                _ => {}
            }
        }
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await.unwrap();
    }
    hits.lock().unwrap().push(Hit {
        auth,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\n{\"ok\": true}";
    let mut stream = reader.into_inner();
    stream.write_all(response).await.unwrap();
    stream.shutdown().await.unwrap();
}

/// Plain-HTTP capturing upstream. Returns its port.
async fn start_http_upstream(hits: Hits) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(capture_one(stream, hits.clone()));
        }
    });
    port
}

/// Send raw bytes to the proxy and return the full response.
async fn roundtrip(proxy_port: u16, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_http_header_swap() {
    let hits: Hits = Hits::default();
    let upstream_port = start_http_upstream(hits.clone()).await;

    let mut proxy = CredentialSwapProxy::new(&swap_table()).unwrap();
    proxy.start().unwrap();

    let request = format!(
        "POST http://127.0.0.1:{}/api/charge HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Authorization: Bearer {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: 2\r\n\r\n{{}}",
        upstream_port, upstream_port, SHADOW
    );
    let response = roundtrip(proxy.port(), request.as_bytes()).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let hit = hits.lock().unwrap().last().cloned().unwrap();
    assert_eq!(hit.auth, format!("Bearer {}", REAL));
    assert!(!hit.auth.contains(SHADOW));

    proxy.stop();
}

#[tokio::test]
async fn test_http_body_swap() {
    let hits: Hits = Hits::default();
    let upstream_port = start_http_upstream(hits.clone()).await;

    let mut proxy = CredentialSwapProxy::new(&swap_table()).unwrap();
    proxy.start().unwrap();

    let payload = format!("{{\"api_key\": \"{}\", \"amount\": 100}}", SHADOW);
    let request = format!(
        "POST http://127.0.0.1:{}/api/charge HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\r\n{}",
        upstream_port,
        upstream_port,
        payload.len(),
        payload
    );
    roundtrip(proxy.port(), request.as_bytes()).await;

    let hit = hits.lock().unwrap().last().cloned().unwrap();
    assert!(hit.body.contains(REAL), "body: {}", hit.body);
    assert!(!hit.body.contains(SHADOW), "shadow leaked: {}", hit.body);
    // Content-Length was recomputed: the upstream read the whole swapped
    // body without hanging, and it parses as the original JSON shape.
    assert!(hit.body.contains("\"amount\": 100"));

    proxy.stop();
}

#[tokio::test]
async fn test_unreachable_upstream_returns_502() {
    let mut proxy = CredentialSwapProxy::new(&swap_table()).unwrap();
    proxy.start().unwrap();

    // A port nothing listens on.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        dead_port, dead_port
    );
    let response = roundtrip(proxy.port(), request.as_bytes()).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);

    proxy.stop();
}

/// Self-signed certificate for the local TLS upstream.
fn upstream_identity() -> (
    rustls::pki_types::CertificateDer<'static>,
    rustls::pki_types::PrivateKeyDer<'static>,
) {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();
    (
        cert.der().clone(),
        rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
            key.serialize_der(),
        )),
    )
}

/// TLS capturing upstream for the MITM test. Returns its port.
async fn start_https_upstream(
    hits: Hits,
    cert: rustls::pki_types::CertificateDer<'static>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
) -> u16 {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let hits = hits.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    capture_one(tls, hits).await;
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn test_https_mitm_header_swap() {
    let hits: Hits = Hits::default();
    let (upstream_cert, upstream_key) = upstream_identity();
    let upstream_port = start_https_upstream(hits.clone(), upstream_cert.clone(), upstream_key).await;

    // The test upstream is self-signed, so the proxy needs it as an extra
    // trust root — the real flow trusts public CAs natively.
    let mut proxy = CredentialSwapProxy::new(&swap_table()).unwrap();
    proxy.add_upstream_root(upstream_cert);
    proxy.start().unwrap();

    // The client plays the sandboxed agent: it trusts the session CA.
    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy.ca_cert_der()).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
    stream
        .write_all(format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", upstream_port).as_bytes())
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    assert!(status.contains("200"), "CONNECT got: {}", status);
    let mut blank = String::new();
    reader.read_line(&mut blank).await.unwrap();

    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, reader).await.unwrap();

    let request = format!(
        "POST /api/charge HTTP/1.1\r\n\
         Host: localhost\r\n\
         Authorization: Bearer {}\r\n\
         Content-Length: 2\r\n\
         Connection: close\r\n\r\n{{}}",
        SHADOW
    );
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("200"), "got: {}", response);

    let hit = hits.lock().unwrap().last().cloned().unwrap();
    assert_eq!(hit.auth, format!("Bearer {}", REAL));
    assert!(!hit.auth.contains(SHADOW), "shadow leaked through the tunnel");

    proxy.stop();
}

#[tokio::test]
async fn test_connect_never_leaks_placeholder_to_raw_upstream() {
    // The upstream speaks no TLS at all: the proxy's upstream handshake
    // fails and the tunnel dies. Whatever bytes the upstream captured must
    // contain neither the placeholder nor the real value.
    let captured: Arc<Mutex<Vec<u8>>> = Arc::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    {
        let captured = captured.clone();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 64 * 1024];
            if let Ok(n) = stream.read(&mut buf).await {
                captured.lock().unwrap().extend_from_slice(&buf[..n]);
            }
            // Close without answering: the proxy's TLS client errors out.
        });
    }

    let mut proxy = CredentialSwapProxy::new(&swap_table()).unwrap();
    proxy.start().unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy.ca_cert_der()).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
    stream
        .write_all(format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", upstream_port).as_bytes())
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    assert!(status.contains("200"));
    let mut blank = String::new();
    reader.read_line(&mut blank).await.unwrap();

    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    if let Ok(mut tls) = connector.connect(server_name, reader).await {
        let _ = tls
            .write_all(format!("GET / HTTP/1.1\r\nAuthorization: Bearer {}\r\n\r\n", SHADOW).as_bytes())
            .await;
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink).await;
    }

    let bytes = captured.lock().unwrap().clone();
    let haystack = String::from_utf8_lossy(&bytes);
    assert!(!haystack.contains(SHADOW), "placeholder reached the upstream socket");
    assert!(!haystack.contains(REAL), "real value reached an untrusted upstream");

    proxy.stop();
}
