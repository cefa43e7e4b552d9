//! Server configuration and session tuning.
//!
//! A [`ServerConfig`] is an immutable snapshot. The session never patches it
//! in place; `ConnectionSession::update_config` swaps in a whole new value
//! which takes effect on the next connect.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::with_channel_sigil;
use crate::error::ConfigError;

/// Default NickServ identify template.
pub const DEFAULT_NICKSERV_COMMAND: &str = "IDENTIFY {password}";
/// Default plaintext IRC port.
pub const DEFAULT_PORT: u16 = 6667;
/// Default TLS IRC port.
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// How the server certificate is checked when `tls` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CertPolicy {
    /// Verify against the webpki root store.
    #[default]
    Verify,
    /// Accept only a certificate whose SHA-256 fingerprint (hex) matches.
    Pinned { sha256: String },
    /// Accept any certificate and report its fingerprint.
    TrustOnFirstUse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    #[default]
    None,
    Socks5,
    Http,
}

/// Outbound proxy the transport factory tunnels through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != ProxyKind::None
    }
}

/// Everything needed to connect to and automate one IRC server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Stable identifier for this server entry.
    pub id: String,
    /// Display name; also the name of the server buffer.
    pub server_name: String,
    pub hostname: String,
    pub port: u16,
    pub tls: bool,
    pub cert_policy: CertPolicy,

    pub nickname: String,
    pub alt_nickname: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub server_password: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub nickserv_password: Option<String>,
    /// Identify template. `{password}` and `{nick}` are substituted; if the
    /// template has neither, the password is appended.
    pub nickserv_command: String,

    /// Comma-separated channels to join after registration.
    pub auto_join_channels: String,
    /// Newline-separated commands run once after registration.
    pub on_connect_script: String,

    pub proxy: ProxyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            server_name: "server".to_string(),
            hostname: String::new(),
            port: DEFAULT_PORT,
            tls: false,
            cert_policy: CertPolicy::Verify,
            nickname: String::new(),
            alt_nickname: None,
            username: None,
            realname: None,
            server_password: None,
            sasl_username: None,
            sasl_password: None,
            nickserv_password: None,
            nickserv_command: DEFAULT_NICKSERV_COMMAND.to_string(),
            auto_join_channels: String::new(),
            on_connect_script: String::new(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check the fields a connection attempt cannot do without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::MissingHostname);
        }
        if self.nickname.trim().is_empty() {
            return Err(ConfigError::MissingNickname);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.sasl_username.as_deref().is_some_and(|u| !u.is_empty())
            && self.sasl_password.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::MissingSaslPassword);
        }
        if self.proxy.is_enabled() && self.proxy.host.trim().is_empty() {
            return Err(ConfigError::MissingProxyHost);
        }
        Ok(())
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().filter(|u| !u.is_empty()).unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().filter(|r| !r.is_empty()).unwrap_or(&self.nickname)
    }

    /// Auto-join entries, trimmed, empty entries dropped, sigil prefixed.
    pub fn auto_join_list(&self) -> Vec<String> {
        self.auto_join_channels
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(with_channel_sigil)
            .collect()
    }

    /// Non-empty on-connect script lines.
    pub fn script_lines(&self) -> Vec<String> {
        self.on_connect_script
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }

    /// The NickServ identify text for `nick`, if a password is configured.
    pub fn identify_text(&self, nick: &str) -> Option<String> {
        let password = self.nickserv_password.as_deref().filter(|p| !p.is_empty())?;
        let template = if self.nickserv_command.trim().is_empty() {
            DEFAULT_NICKSERV_COMMAND
        } else {
            self.nickserv_command.trim()
        };
        if template.contains("{password}") || template.contains("{nick}") {
            Some(template.replace("{password}", password).replace("{nick}", nick))
        } else {
            Some(format!("{template} {password}"))
        }
    }
}

/// Tuning knobs for a [`crate::session::ConnectionSession`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Capacity of the single-writer request queue.
    pub queue_capacity: usize,
    /// Capacity of the message bus ring; lagging subscribers skip ahead.
    pub bus_capacity: usize,
    /// Pause between on-connect script lines (flood protection).
    pub script_line_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            bus_capacity: 1024,
            script_line_delay: Duration::from_millis(500),
        }
    }
}
