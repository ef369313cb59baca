//! Reachability Probe
//!
//! Raw TCP connectivity test against a `(host, port)` pair, with an optional
//! best-effort banner read and an optional TLS handshake on a fresh connection.
//!
//! # Error Policy
//! Every failure (DNS, refused, timeout, TLS) is returned inside the
//! [`ProbeResult`] as a [`ProbeFailure`] value. Nothing here returns `Err`.
//! A TLS failure is recorded separately and never flips `reachable`.
//!
//! # Statelessness
//! [`TcpProber`] holds no state; probing the same endpoint twice yields two
//! independent results.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Probe tuning knobs
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Budget for resolution plus TCP connect
    pub timeout: Duration,
    /// Try to capture an unsolicited banner after connecting
    pub read_banner: bool,
    /// Secondary timeout for the banner read
    pub banner_timeout: Duration,
    /// Maximum banner bytes kept
    pub banner_limit: usize,
    /// Perform a TLS handshake on a fresh connection
    pub tls: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            read_banner: true,
            banner_timeout: Duration::from_secs(1),
            banner_limit: 512,
            tls: false,
        }
    }
}

impl ProbeOptions {
    /// Connect-only profile used by port discovery (no banner, no TLS)
    #[must_use]
    pub fn reachability_only(timeout: Duration) -> Self {
        Self { timeout, read_banner: false, tls: false, ..Self::default() }
    }
}

/// Why a probe step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Host name did not resolve
    Dns,
    /// Remote actively refused the connection
    Refused,
    /// No answer within the budget
    Timeout,
    /// Any other I/O failure
    Other,
    /// TCP reachable but the TLS handshake failed
    Tls,
}

/// Failure description carried inside a [`ProbeResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Heuristic guess of what is listening, from the captured banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceGuess {
    /// HTTP status line or headers
    Http,
    /// `MySQL` protocol-10 server greeting
    MysqlGreeting,
    /// TLS alert record sent in reply to plaintext
    TlsAlert,
    /// Connected but the server sent nothing (typical for client-speaks-first databases)
    Silent,
    /// Bytes that match no known pattern
    Unrecognized,
}

/// Negotiated TLS parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsReport {
    pub protocol: String,
    pub cipher: String,
}

/// Outcome of a single probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub host: String,
    pub port: u16,
    /// TCP connection established within the timeout
    pub reachable: bool,
    /// Connect latency, only on success
    pub latency: Option<Duration>,
    /// First bytes the server sent unprompted
    pub banner: Option<Vec<u8>>,
    /// Why the TCP connect failed
    pub failure: Option<ProbeFailure>,
    /// Handshake report when TLS was requested and succeeded
    pub tls: Option<TlsReport>,
    /// Handshake failure when TLS was requested and failed
    pub tls_failure: Option<ProbeFailure>,
}

impl ProbeResult {
    fn unreachable(host: &str, port: u16, failure: ProbeFailure) -> Self {
        Self {
            host: host.to_string(),
            port,
            reachable: false,
            latency: None,
            banner: None,
            failure: Some(failure),
            tls: None,
            tls_failure: None,
        }
    }

    /// Classification of the captured banner
    #[must_use]
    pub fn guess(&self) -> ServiceGuess {
        classify_banner(self.banner.as_deref())
    }

    /// Printable rendering of the banner (non-ASCII escaped)
    #[must_use]
    pub fn banner_preview(&self) -> Option<String> {
        self.banner.as_ref().map(|bytes| bytes.escape_ascii().to_string())
    }
}

/// Anything that can test `(host, port)` reachability
pub trait Reachability: Send + Sync {
    fn probe(&self, host: &str, port: u16, options: &ProbeOptions) -> impl Future<Output = ProbeResult> + Send;
}

/// Real network prober
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl Reachability for TcpProber {
    async fn probe(&self, host: &str, port: u16, options: &ProbeOptions) -> ProbeResult {
        let started = Instant::now();
        let deadline = started + options.timeout;

        let mut stream = match connect_before(host, port, deadline, options.timeout).await {
            Ok(stream) => stream,
            Err(failure) => {
                debug!(host, port, kind = ?failure.kind, "probe failed: {}", failure.message);
                return ProbeResult::unreachable(host, port, failure);
            }
        };
        let latency = started.elapsed();
        debug!(host, port, latency_ms = latency.as_millis() as u64, "tcp connect ok");

        let banner = if options.read_banner {
            read_banner(&mut stream, options.banner_timeout, options.banner_limit).await
        } else {
            None
        };
        drop(stream);

        let (tls, tls_failure) = if options.tls {
            match tls_handshake(host, port, options.timeout).await {
                Ok(report) => (Some(report), None),
                Err(failure) => {
                    debug!(host, port, "tls handshake failed: {}", failure.message);
                    (None, Some(failure))
                }
            }
        } else {
            (None, None)
        };

        ProbeResult {
            host: host.to_string(),
            port,
            reachable: true,
            latency: Some(latency),
            banner,
            failure: None,
            tls,
            tls_failure,
        }
    }
}

/// Resolve and connect, trying each resolved address until the deadline
async fn connect_before(
    host: &str,
    port: u16,
    deadline: Instant,
    budget: Duration,
) -> Result<TcpStream, ProbeFailure> {
    let timed_out = || {
        ProbeFailure::new(
            FailureKind::Timeout,
            format!("connection to {host}:{port} timed out after {}ms", budget.as_millis()),
        )
    };

    let addrs: Vec<SocketAddr> = match timeout_at(deadline, lookup_host((host, port))).await {
        Err(_) => return Err(timed_out()),
        Ok(Err(e)) => {
            return Err(ProbeFailure::new(FailureKind::Dns, format!("could not resolve {host}: {e}")));
        }
        Ok(Ok(addrs)) => addrs.collect(),
    };

    let mut last_failure = ProbeFailure::new(FailureKind::Dns, format!("{host} resolved to no addresses"));
    for addr in addrs {
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_failure = io_failure(&e, addr),
            Err(_) => return Err(timed_out()),
        }
    }

    Err(last_failure)
}

fn io_failure(err: &io::Error, addr: SocketAddr) -> ProbeFailure {
    let kind = match err.kind() {
        io::ErrorKind::ConnectionRefused => FailureKind::Refused,
        io::ErrorKind::TimedOut => FailureKind::Timeout,
        _ => FailureKind::Other,
    };
    ProbeFailure::new(kind, format!("connection to {addr} failed: {err}"))
}

/// Single bounded read; silence is not a failure
async fn read_banner(stream: &mut TcpStream, wait: Duration, limit: usize) -> Option<Vec<u8>> {
    let mut buf = vec![0_u8; limit];
    match timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            Some(buf)
        }
        _ => None,
    }
}

async fn tls_handshake(host: &str, port: u16, budget: Duration) -> Result<TlsReport, ProbeFailure> {
    let tls_err = |message: String| ProbeFailure::new(FailureKind::Tls, message);

    let config = client_config().map_err(|e| tls_err(format!("TLS setup failed: {e}")))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| tls_err(format!("invalid TLS server name '{host}': {e}")))?;
    let connector = TlsConnector::from(Arc::new(config));

    let handshake = async {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| tls_err(format!("TCP connect for TLS handshake failed: {e}")))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| tls_err(format!("TLS handshake failed: {e}")))?;

        let (_, session) = stream.get_ref();
        let protocol = session.protocol_version().map_or_else(|| "unknown".to_string(), |v| format!("{v:?}"));
        let cipher = session
            .negotiated_cipher_suite()
            .map_or_else(|| "unknown".to_string(), |suite| format!("{:?}", suite.suite()));

        Ok::<_, ProbeFailure>(TlsReport { protocol, cipher })
    };

    timeout(budget, handshake)
        .await
        .map_err(|_| tls_err(format!("TLS handshake timed out after {}ms", budget.as_millis())))?
}

/// rustls client with Mozilla roots
fn client_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

const HTTP_HEADERS: [&str; 4] = ["server:", "content-type:", "content-length:", "location:"];

/// Guess the service from its banner
#[must_use]
pub fn classify_banner(banner: Option<&[u8]>) -> ServiceGuess {
    let Some(bytes) = banner.filter(|b| !b.is_empty()) else {
        return ServiceGuess::Silent;
    };

    if bytes.starts_with(b"HTTP/") {
        return ServiceGuess::Http;
    }

    let text = String::from_utf8_lossy(bytes);
    let has_http_header = text.lines().any(|line| {
        HTTP_HEADERS
            .iter()
            .any(|header| line.get(..header.len()).is_some_and(|prefix| prefix.eq_ignore_ascii_case(header)))
    });
    if has_http_header {
        return ServiceGuess::Http;
    }

    if bytes.len() >= 2 && bytes[0] == 0x15 && bytes[1] == 0x03 {
        return ServiceGuess::TlsAlert;
    }

    // 3-byte length, sequence id, then protocol version 10
    if bytes.len() > 4 && bytes[4] == 0x0a {
        return ServiceGuess::MysqlGreeting;
    }

    ServiceGuess::Unrecognized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_classify_http_status_line() {
        assert_eq!(classify_banner(Some(b"HTTP/1.1 400 Bad Request\r\n")), ServiceGuess::Http);
    }

    #[test]
    fn test_classify_http_header_only() {
        assert_eq!(classify_banner(Some(b"garbage\r\nServer: nginx\r\n")), ServiceGuess::Http);
        assert_eq!(classify_banner(Some(b"x\r\ncontent-type: text/html\r\n")), ServiceGuess::Http);
    }

    #[test]
    fn test_classify_mysql_greeting() {
        let greeting = [0x4a, 0x00, 0x00, 0x00, 0x0a, b'8', b'.', b'0'];
        assert_eq!(classify_banner(Some(&greeting)), ServiceGuess::MysqlGreeting);
    }

    #[test]
    fn test_classify_tls_alert() {
        assert_eq!(classify_banner(Some(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x46])), ServiceGuess::TlsAlert);
    }

    #[test]
    fn test_classify_silent_and_unknown() {
        assert_eq!(classify_banner(None), ServiceGuess::Silent);
        assert_eq!(classify_banner(Some(b"")), ServiceGuess::Silent);
        assert_eq!(classify_banner(Some(b"+OK ready")), ServiceGuess::Unrecognized);
    }

    #[test]
    fn test_reachability_only_profile() {
        let options = ProbeOptions::reachability_only(Duration::from_secs(2));
        assert!(!options.read_banner);
        assert!(!options.tls);
        assert_eq!(options.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_banner_preview_escapes_binary() {
        let mut result = ProbeResult::unreachable("h", 1, ProbeFailure::new(FailureKind::Other, "x"));
        result.banner = Some(vec![b'o', b'k', 0x00]);
        assert_eq!(result.banner_preview().as_deref(), Some("ok\\x00"));
    }

    #[tokio::test]
    async fn test_probe_refused_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpProber.probe("127.0.0.1", port, &ProbeOptions::default()).await;
        assert!(!result.reachable);
        assert!(result.latency.is_none());
        assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::Refused));
    }

    #[tokio::test]
    async fn test_probe_captures_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.0 200 OK\r\nServer: test\r\n\r\n").await;
            }
        });

        let result = TcpProber.probe("127.0.0.1", port, &ProbeOptions::default()).await;
        assert!(result.reachable);
        assert!(result.latency.is_some());
        assert_eq!(result.guess(), ServiceGuess::Http);
    }

    #[tokio::test]
    async fn test_expired_deadline_reports_timeout() {
        // Name resolution goes through the blocking pool, so it cannot finish before the deadline
        let failure = connect_before("localhost", 5432, Instant::now(), Duration::from_millis(300)).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.message, "connection to localhost:5432 timed out after 300ms");
    }

    #[tokio::test]
    async fn test_probe_dns_failure() {
        let result = TcpProber.probe("no-such-host.invalid", 443, &ProbeOptions::default()).await;
        assert!(!result.reachable);
        let kind = result.failure.map(|f| f.kind);
        assert!(matches!(kind, Some(FailureKind::Dns | FailureKind::Timeout)));
    }
}
