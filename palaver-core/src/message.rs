//! Chat log messages emitted by the session.
//!
//! Messages are immutable once created and identified by a ULID string
//! (26-character Crockford base32: 48 bits of milliseconds, 80 random bits),
//! so ids sort by creation time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// CTCP framing byte.
pub const CTCP_DELIM: char = '\x01';

/// What kind of log line a [`Message`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Normal,
    Action,
    Notice,
    Join,
    Part,
    Quit,
    Kick,
    Nick,
    Topic,
    Mode,
    Error,
    Server,
    System,
    Ctcp,
}

/// One entry in the chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    /// Channel, query or server buffer the line belongs to.
    pub target: String,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub is_self: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        target: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
        is_self: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_id(),
            target: target.into(),
            sender: sender.into(),
            content: content.into(),
            kind,
            is_self,
            timestamp,
        }
    }
}

/// Generate a new ULID string.
pub fn generate_id() -> String {
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;

    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut buf = String::with_capacity(26);
    for i in (0..10).rev() {
        buf.push(CROCKFORD[((now_ms >> (i * 5)) & 0x1F) as usize] as char);
    }
    let r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for i in (0..16).rev() {
        buf.push(CROCKFORD[((r >> (i * 5)) & 0x1F) as usize] as char);
    }
    buf
}

/// Hands out timestamps that never go backwards for the same target.
///
/// Wall-clock adjustments can move `Utc::now()` backwards; log order per
/// buffer must still match arrival order.
#[derive(Debug, Clone, Default)]
pub struct TargetClock {
    last: HashMap<String, DateTime<Utc>>,
}

impl TargetClock {
    pub fn stamp(&mut self, target: &str) -> DateTime<Utc> {
        self.stamp_at(target, Utc::now())
    }

    pub fn stamp_at(&mut self, target: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last.get(target) {
            Some(prev) if *prev > now => *prev,
            _ => now,
        };
        self.last.insert(target.to_string(), ts);
        ts
    }
}

/// Unwrap a CTCP ACTION (`\x01ACTION text\x01`) payload.
///
/// The closing delimiter is optional; some clients omit it.
pub fn unwrap_action(text: &str) -> Option<&str> {
    let body = text.strip_prefix(CTCP_DELIM)?;
    let body = body.strip_suffix(CTCP_DELIM).unwrap_or(body);
    let rest = body.strip_prefix("ACTION")?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix(' ')
}

pub fn wrap_action(text: &str) -> String {
    format!("{CTCP_DELIM}ACTION {text}{CTCP_DELIM}")
}

/// Split a CTCP request other than ACTION into `(command, args)`.
pub fn parse_ctcp(text: &str) -> Option<(&str, &str)> {
    let body = text.strip_prefix(CTCP_DELIM)?;
    let body = body.strip_suffix(CTCP_DELIM).unwrap_or(body);
    let (command, args) = body.split_once(' ').unwrap_or((body, ""));
    if command.is_empty() || command == "ACTION" {
        return None;
    }
    Some((command, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn id_length_and_uniqueness() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| CROCKFORD.contains(&c)));
    }

    #[test]
    fn ids_sort_by_time() {
        let a = generate_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_id();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn clock_never_goes_backwards_per_target() {
        let mut clock = TargetClock::default();
        let t0 = Utc::now();
        assert_eq!(clock.stamp_at("#a", t0), t0);
        let earlier = t0 - Duration::seconds(5);
        assert_eq!(clock.stamp_at("#a", earlier), t0);
        // Other targets are independent.
        assert_eq!(clock.stamp_at("#b", earlier), earlier);
    }

    #[test]
    fn action_unwrapping() {
        assert_eq!(unwrap_action("\x01ACTION dances\x01"), Some("dances"));
        assert_eq!(unwrap_action("\x01ACTION dances"), Some("dances"));
        assert_eq!(unwrap_action("\x01ACTION\x01"), Some(""));
        assert_eq!(unwrap_action("ACTION dances"), None);
        assert_eq!(unwrap_action("\x01VERSION\x01"), None);
        assert_eq!(unwrap_action(&wrap_action("waves")), Some("waves"));
    }

    #[test]
    fn ctcp_request_parsing() {
        assert_eq!(parse_ctcp("\x01VERSION\x01"), Some(("VERSION", "")));
        assert_eq!(parse_ctcp("\x01PING 12345\x01"), Some(("PING", "12345")));
        assert_eq!(parse_ctcp("\x01ACTION hi\x01"), None);
        assert_eq!(parse_ctcp("plain"), None);
    }
}
