//! Persistent configuration for palaver.
//!
//! Config file lives at `~/.config/palaver/config.toml`. The `[server]`
//! table is a `palaver_core::ServerConfig`; command-line flags override it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use palaver_core::config::{DEFAULT_PORT, DEFAULT_TLS_PORT, ProxyConfig, ProxyKind};
use palaver_core::{ServerConfig, SessionOptions};

/// Contents of config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerConfig,
    /// Pause between on-connect script lines, in milliseconds.
    pub script_line_delay_ms: Option<u64>,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("palaver")
        .join("config.toml")
}

impl FileConfig {
    /// Load `path`. A missing file is not an error; a malformed one is.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("can't read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("bad config file {}", path.display()))
    }
}

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub tls: bool,
    pub nick: Option<String>,
    pub channels: Option<String>,
    pub sasl_user: Option<String>,
    pub sasl_password: Option<String>,
    pub nickserv_password: Option<String>,
    pub proxy: Option<String>,
    pub script_delay_ms: Option<u64>,
}

/// Merge: CLI overrides > config file > defaults.
pub fn resolve(overrides: &Overrides, file: FileConfig) -> Result<(ServerConfig, SessionOptions)> {
    let mut server = file.server;
    let mut explicit_port = overrides.port.is_some();

    if let Some(addr) = &overrides.server {
        let (host, port) = split_host_port(addr)?;
        server.hostname = host;
        if let Some(port) = port {
            server.port = port;
            explicit_port = true;
        }
        if server.server_name == ServerConfig::default().server_name {
            server.server_name = server.hostname.clone();
        }
    }
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if overrides.tls {
        server.tls = true;
        if !explicit_port && server.port == DEFAULT_PORT {
            server.port = DEFAULT_TLS_PORT;
        }
    } else if server.port == DEFAULT_TLS_PORT {
        // Auto-detect TLS from the conventional port.
        server.tls = true;
    }
    if let Some(nick) = &overrides.nick {
        server.nickname = nick.clone();
    }
    if let Some(channels) = &overrides.channels {
        server.auto_join_channels = channels.clone();
    }
    if overrides.sasl_user.is_some() {
        server.sasl_username = overrides.sasl_user.clone();
    }
    if overrides.sasl_password.is_some() {
        server.sasl_password = overrides.sasl_password.clone();
    }
    if overrides.nickserv_password.is_some() {
        server.nickserv_password = overrides.nickserv_password.clone();
    }
    if let Some(proxy) = &overrides.proxy {
        server.proxy = parse_proxy(proxy)?;
    }
    if server.nickname.trim().is_empty() {
        server.nickname = std::env::var("USER").unwrap_or_else(|_| "palaver".to_string());
    }

    let mut options = SessionOptions::default();
    if let Some(ms) = overrides.script_delay_ms.or(file.script_line_delay_ms) {
        options.script_line_delay = Duration::from_millis(ms);
    }
    Ok((server, options))
}

/// `host`, `host:port` or `[v6]:port`.
pub fn split_host_port(addr: &str) -> Result<(String, Option<u16>)> {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            bail!("unterminated IPv6 address: {addr}");
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().with_context(|| format!("bad port in {addr}"))?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), Some(port.parse().with_context(|| format!("bad port in {addr}"))?)))
        }
        _ => Ok((addr.to_string(), None)),
    }
}

/// `socks5://[user:pass@]host[:port]` or `http://...`.
pub fn parse_proxy(url: &str) -> Result<ProxyConfig> {
    let Some((scheme, rest)) = url.split_once("://") else {
        bail!("proxy must look like socks5://host:port or http://host:port");
    };
    let kind = match scheme.to_ascii_lowercase().as_str() {
        "socks5" | "socks5h" => ProxyKind::Socks5,
        "http" => ProxyKind::Http,
        other => bail!("unsupported proxy scheme {other}"),
    };
    let (auth, hostport) = match rest.rsplit_once('@') {
        Some((auth, hostport)) => (Some(auth), hostport),
        None => (None, rest),
    };
    let (username, password) = match auth.map(|a| a.split_once(':').unwrap_or((a, ""))) {
        Some((u, p)) => (Some(u.to_string()), Some(p.to_string()).filter(|p| !p.is_empty())),
        None => (None, None),
    };
    let (host, port) = split_host_port(hostport.trim_end_matches('/'))?;
    Ok(ProxyConfig { kind, host, port: port.unwrap_or(0), username, password })
}
