//! HTTP/HTTPS intercepting proxy that swaps shadow credentials for real ones.
//!
//! Code running inside the sandbox makes real API calls using shadow
//! credentials (e.g. `STRIPE_KEY=ftl_shadow_...`). This proxy intercepts
//! those calls and swaps in the real values before they reach the upstream
//! server, so live code can run against real APIs while the agent never
//! learns the actual secrets.
//!
//! - HTTP: the proxy receives the full request, swaps bytes in headers and
//!   body, and forwards it.
//! - HTTPS: MITM via the CONNECT tunnel with a per-host leaf certificate
//!   signed by an ephemeral CA that gets installed into the container
//!   trust store.
//!
//! Per-connection failures close only that connection. Nothing here is
//! ever fatal to the session that owns the proxy.

mod conn;
mod swap;
mod tls;

use std::collections::BTreeMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::debug;

pub use swap::SwapTable;
pub use tls::ProxyCa;

use conn::ProxyState;

/// Where the CA lands inside the container; `update-ca-certificates`
/// folds it into the system bundle from there.
const CONTAINER_CA_PATH: &str = "/usr/local/share/ca-certificates/ftl-proxy.crt";

/// Threaded HTTP/HTTPS intercepting proxy bound to loopback.
///
/// Construction allocates the port and generates the session CA; `start`
/// brings up the server on a background thread; `stop` shuts it down and
/// closes all active relays. `stop` is idempotent.
pub struct CredentialSwapProxy {
    port: u16,
    listener: Option<StdTcpListener>,
    swap: Arc<SwapTable>,
    ca: Arc<ProxyCa>,
    extra_upstream_roots: Vec<CertificateDer<'static>>,
    shutdown: Arc<Notify>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CredentialSwapProxy {
    /// Build a proxy for a swap table of `{placeholder: real_value}`.
    pub fn new(swap_table: &BTreeMap<String, String>) -> Result<Self> {
        let listener =
            StdTcpListener::bind("127.0.0.1:0").context("Failed to bind proxy port")?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            port,
            listener: Some(listener),
            swap: Arc::new(SwapTable::new(swap_table)),
            ca: Arc::new(ProxyCa::generate()?),
            extra_upstream_roots: Vec::new(),
            shutdown: Arc::new(Notify::new()),
            thread: None,
        })
    }

    /// Add trust roots for upstream verification beyond the native store.
    /// Needed when upstreams present certificates from a private CA.
    pub fn add_upstream_root(&mut self, cert: CertificateDer<'static>) {
        self.extra_upstream_roots.push(cert);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL as seen from inside the container (`host.docker.internal`
    /// resolves to the host gateway).
    pub fn url(&self) -> String {
        format!("http://host.docker.internal:{}", self.port)
    }

    /// Env vars to inject into the container for proxy routing.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let url = self.url();
        let no_proxy = "localhost,127.0.0.1,::1".to_string();
        vec![
            ("HTTP_PROXY".to_string(), url.clone()),
            ("HTTPS_PROXY".to_string(), url.clone()),
            ("http_proxy".to_string(), url.clone()),
            ("https_proxy".to_string(), url),
            // Don't proxy loopback or the agent's own local traffic
            ("NO_PROXY".to_string(), no_proxy.clone()),
            ("no_proxy".to_string(), no_proxy),
        ]
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.ca.ca_cert_pem()
    }

    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca.ca_cert_der()
    }

    /// Shell command that installs the session CA into the container trust
    /// store. Run through the sandbox's root exec after boot, before the
    /// agent starts. Base64 avoids quoting and newline issues.
    pub fn trust_install_command(&self) -> String {
        let cert_b64 = BASE64.encode(self.ca.ca_cert_pem().as_bytes());
        format!(
            "echo '{}' | base64 -d > {} && update-ca-certificates",
            cert_b64, CONTAINER_CA_PATH
        )
    }

    /// Start the proxy server on a background thread.
    pub fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("Proxy already started or stopped")?;
        listener.set_nonblocking(true)?;

        let swap = self.swap.clone();
        let ca = self.ca.clone();
        let extra_roots = self.extra_upstream_roots.clone();
        let shutdown = self.shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("ftl-proxy".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        debug!(error = %e, "Failed to build proxy runtime");
                        return;
                    }
                };
                rt.block_on(serve(listener, swap, ca, extra_roots, shutdown));
                // Dropping the runtime aborts any in-flight relay task.
            })
            .context("Failed to spawn proxy thread")?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Shut down the proxy server. Idempotent; interrupts the blocked
    /// accept loop and closes active relays.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.notify_one();
            let _ = thread.join();
        }
    }
}

impl Drop for CredentialSwapProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: StdTcpListener,
    swap: Arc<SwapTable>,
    ca: Arc<ProxyCa>,
    extra_roots: Vec<CertificateDer<'static>>,
    shutdown: Arc<Notify>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            debug!(error = %e, "Failed to register proxy listener");
            return;
        }
    };

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(tls::upstream_root_store(&extra_roots))
        .with_no_client_auth();
    let http = reqwest::Client::builder()
        .no_proxy()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default();
    let state = Arc::new(ProxyState {
        swap,
        ca,
        http,
        upstream_tls: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
    });

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            conn::handle_connection(stream, state).await;
                        });
                    }
                    Err(e) => debug!(error = %e, "Accept failed"),
                }
            }
        }
    }
}
