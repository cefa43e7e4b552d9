//! Connection establishment: TCP, optional SOCKS5 / HTTP CONNECT proxy,
//! optional TLS with one of three certificate policies.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use palaver_core::config::{CertPolicy, ProxyConfig, ProxyKind, ServerConfig};
use palaver_core::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on an HTTP CONNECT response header.
const MAX_PROXY_HEADER: usize = 8192;

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

pub struct Established {
    pub connection: Connection,
    /// SHA-256 of the server certificate when it was accepted without
    /// verification (trust on first use).
    pub unverified_fingerprint: Option<String>,
}

/// Open the socket, tunnel through the proxy if configured, then run the
/// TLS handshake if `config.tls` is set.
pub async fn establish(config: &ServerConfig) -> Result<Established, TransportError> {
    let mode = if config.tls { "TLS" } else { "plain" };
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, open_tcp(config))
        .await
        .map_err(|_| TransportError::Io(format!("connect to {}:{} timed out", config.hostname, config.port)))??;
    tracing::debug!(host = %config.hostname, port = config.port, mode, "TCP connected");

    if !config.tls {
        return Ok(Established { connection: Connection::Plain(tcp), unverified_fingerprint: None });
    }

    let tls_config = match &config.cert_policy {
        CertPolicy::Verify => {
            tracing::debug!("TLS: verifying server certificate");
            rustls_default_config()
        }
        CertPolicy::Pinned { sha256 } => {
            tracing::debug!("TLS: pinned certificate");
            rustls_fingerprint_config(Some(parse_fingerprint(sha256)?))?
        }
        CertPolicy::TrustOnFirstUse => {
            tracing::debug!("TLS: trust on first use");
            rustls_fingerprint_config(None)?
        }
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let dns_name = rustls::pki_types::ServerName::try_from(config.hostname.clone())
        .map_err(|e| TransportError::Tls(format!("invalid server name {}: {e}", config.hostname)))?;
    let tls = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(format!("handshake with {} failed: {e}", config.hostname)))?;
    tracing::debug!("TLS handshake complete");

    let unverified_fingerprint = match config.cert_policy {
        CertPolicy::TrustOnFirstUse => tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| format_fingerprint(&Sha256::digest(cert.as_ref()))),
        _ => None,
    };
    Ok(Established { connection: Connection::Tls(Box::new(tls)), unverified_fingerprint })
}

async fn open_tcp(config: &ServerConfig) -> Result<TcpStream, TransportError> {
    let proxy = &config.proxy;
    if !proxy.is_enabled() {
        return TcpStream::connect((config.hostname.as_str(), config.port))
            .await
            .map_err(|e| TransportError::Io(format!("TCP connect to {}:{} failed: {e}", config.hostname, config.port)));
    }

    let port = proxy_port(proxy);
    let mut tcp = TcpStream::connect((proxy.host.as_str(), port))
        .await
        .map_err(|e| TransportError::Proxy(format!("connect to proxy {}:{port} failed: {e}", proxy.host)))?;
    let auth = proxy.username.as_deref().map(|u| (u, proxy.password.as_deref().unwrap_or_default()));
    match proxy.kind {
        ProxyKind::Socks5 => socks5_connect(&mut tcp, &config.hostname, config.port, auth).await?,
        ProxyKind::Http => http_connect(&mut tcp, &config.hostname, config.port, auth).await?,
        ProxyKind::None => {}
    }
    tracing::debug!(proxy = %proxy.host, kind = ?proxy.kind, "proxy tunnel open");
    Ok(tcp)
}

fn proxy_port(proxy: &ProxyConfig) -> u16 {
    match (proxy.port, proxy.kind) {
        (0, ProxyKind::Http) => 8080,
        (0, _) => 1080,
        (port, _) => port,
    }
}

fn proxy_err(e: std::io::Error) -> TransportError {
    TransportError::Proxy(e.to_string())
}

/// RFC 1928 CONNECT by domain name, with RFC 1929 username/password auth
/// when credentials are given.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if auth.is_some() { &[5, 2, 0x00, 0x02] } else { &[5, 1, 0x00] };
    stream.write_all(greeting).await.map_err(proxy_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(proxy_err)?;
    if reply[0] != 5 {
        return Err(TransportError::Proxy(format!("not a SOCKS5 proxy (version {})", reply[0])));
    }
    match (reply[1], auth) {
        (0x00, _) => {}
        (0x02, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(TransportError::Proxy("SOCKS5 credentials too long".into()));
            }
            let mut req = vec![1, user.len() as u8];
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream.write_all(&req).await.map_err(proxy_err)?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await.map_err(proxy_err)?;
            if status[1] != 0 {
                return Err(TransportError::Auth("SOCKS5 proxy rejected credentials".into()));
            }
        }
        _ => return Err(TransportError::Proxy("SOCKS5 proxy accepted no offered auth method".into())),
    }

    if host.len() > 255 {
        return Err(TransportError::Proxy("hostname too long for SOCKS5".into()));
    }
    let mut req = vec![5, 1, 0, 3, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await.map_err(proxy_err)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(proxy_err)?;
    if head[1] != 0 {
        return Err(TransportError::Proxy(format!("SOCKS5 connect failed: {}", socks5_reply(head[1]))));
    }
    // Skip the bound address.
    let skip = match head[3] {
        1 => 4 + 2,
        4 => 16 + 2,
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(proxy_err)?;
            len[0] as usize + 2
        }
        other => return Err(TransportError::Proxy(format!("SOCKS5 address type {other} not supported"))),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await.map_err(proxy_err)?;
    Ok(())
}

fn socks5_reply(code: u8) -> &'static str {
    match code {
        1 => "general failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown error",
    }
}

/// HTTP CONNECT tunnel. Reads the response header byte by byte so nothing
/// past the blank line is consumed.
pub async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = auth {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await.map_err(proxy_err)?;

    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_PROXY_HEADER {
            return Err(TransportError::Proxy("proxy response header too large".into()));
        }
        let n = stream.read(&mut byte).await.map_err(proxy_err)?;
        if n == 0 {
            return Err(TransportError::Proxy("proxy closed the connection".into()));
        }
        header.push(byte[0]);
    }

    let header = String::from_utf8_lossy(&header);
    let status_line = header.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    match status {
        "200" => Ok(()),
        "407" => Err(TransportError::Auth("proxy authentication required".into())),
        _ => Err(TransportError::Proxy(format!("proxy refused CONNECT: {status_line}"))),
    }
}

/// Colon-separated lowercase hex.
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Accepts `AB:CD:..`, `abcd..` or space-separated hex.
pub fn parse_fingerprint(text: &str) -> Result<Vec<u8>, TransportError> {
    let cleaned: String = text.chars().filter(|c| !matches!(c, ':' | ' ')).collect();
    let bytes = hex::decode(cleaned.to_ascii_lowercase())
        .map_err(|e| TransportError::Tls(format!("invalid pinned fingerprint: {e}")))?;
    if bytes.len() != 32 {
        return Err(TransportError::Tls("pinned fingerprint must be a SHA-256 digest".into()));
    }
    Ok(bytes)
}

fn install_crypto_provider() {
    // ring wins when both features are on.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_fingerprint_config(expected: Option<Vec<u8>>) -> Result<rustls::ClientConfig, TransportError> {
    install_crypto_provider();
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .ok_or_else(|| TransportError::Tls("no TLS crypto provider available".into()))?;
    Ok(rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier { expected, provider }))
        .with_no_client_auth())
}

/// Skips chain validation. With `expected` set, only a leaf certificate
/// whose SHA-256 matches is accepted; without it, any certificate is.
/// Handshake signatures are always checked.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<Vec<u8>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.expected {
            let actual = Sha256::digest(end_entity.as_ref());
            if actual.as_slice() != expected.as_slice() {
                tracing::error!(fingerprint = %format_fingerprint(&actual), "certificate does not match pin");
                return Err(rustls::Error::General("certificate fingerprint mismatch".into()));
            }
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
