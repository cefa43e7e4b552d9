//! IRC line codec.
//!
//! Parses `[@tags] [:source] COMMAND [params] [:trailing]` and formats
//! outgoing lines. Outgoing text is stripped of CR/LF so user input can never
//! smuggle a second command onto the wire.

use std::collections::HashMap;
use std::fmt;

/// One IRC protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags.
    pub tags: HashMap<String, String>,
    /// `nick!user@host` or a server name.
    pub source: Option<String>,
    /// Upper-cased command or three-digit numeric.
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new<I, S>(command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: HashMap::new(),
            source: None,
            command: command.to_string(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one line. Returns `None` for blank or truncated input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let mut tags = HashMap::new();
        if let Some(after) = rest.strip_prefix('@') {
            let (raw, tail) = after.split_once(' ')?;
            tags = parse_tags(raw);
            rest = tail.trim_start_matches(' ');
        }

        let mut source = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (src, tail) = after.split_once(' ')?;
            source = Some(src.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((c, tail)) => (c, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, tail)) => {
                    params.push(p.to_string());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            tags,
            source,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// The nick part of the source, or the whole source for servers.
    pub fn nick(&self) -> Option<&str> {
        self.source.as_deref().map(nick_of)
    }

    /// True when the source is a user (`nick!user@host`) rather than a server.
    pub fn from_user(&self) -> bool {
        self.source.as_deref().is_some_and(|s| s.contains('!'))
    }

    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }

    /// Numeric code, if the command is a three-digit reply.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, ":{source} ")?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let param = sanitize(param);
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// `nick!user@host` → `nick`.
pub fn nick_of(source: &str) -> &str {
    source.split(['!', '@']).next().unwrap_or(source)
}

/// Drop CR, LF and NUL.
pub fn sanitize(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains(['\r', '\n', '\0']) {
        text.replace(['\r', '\n', '\0'], " ").into()
    } else {
        text.into()
    }
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter(|t| !t.is_empty())
        .map(|t| match t.split_once('=') {
            Some((k, v)) => (k.to_string(), unescape_tag(v)),
            None => (t.to_string(), String::new()),
        })
        .collect()
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_command() {
        let m = Message::parse("PING :irc.libera.chat\r\n").unwrap();
        assert_eq!(m.command, "PING");
        assert_eq!(m.params, vec!["irc.libera.chat"]);
        assert!(m.source.is_none());
    }

    #[test]
    fn parse_source_and_trailing() {
        let m = Message::parse(":alice!a@host PRIVMSG #rust :hello: world").unwrap();
        assert_eq!(m.nick(), Some("alice"));
        assert!(m.from_user());
        assert_eq!(m.params, vec!["#rust", "hello: world"]);
    }

    #[test]
    fn parse_numeric() {
        let m = Message::parse(":irc.example.net 353 me = #rust :@alice +bob carol").unwrap();
        assert_eq!(m.numeric(), Some(353));
        assert_eq!(m.param(3), Some("@alice +bob carol"));
        assert!(!m.from_user());
        assert_eq!(Message::parse("PRIVMSG x y").unwrap().numeric(), None);
    }

    #[test]
    fn parse_tags() {
        let m = Message::parse("@time=2024-01-01T00:00:00Z;msgid=a\\sb;bot :x!y@z NOTICE me :hi").unwrap();
        assert_eq!(m.tags["time"], "2024-01-01T00:00:00Z");
        assert_eq!(m.tags["msgid"], "a b");
        assert_eq!(m.tags["bot"], "");
        assert_eq!(m.command, "NOTICE");
    }

    #[test]
    fn parse_collapses_extra_spaces() {
        let m = Message::parse(":srv  MODE  #c  +o   bob").unwrap();
        assert_eq!(m.params, vec!["#c", "+o", "bob"]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("\r\n").is_none());
        assert!(Message::parse(":onlysource").is_none());
        assert!(Message::parse("@tagsonly").is_none());
    }

    #[test]
    fn format_trailing_param() {
        assert_eq!(Message::new("PRIVMSG", ["#rust", "hi there"]).to_string(), "PRIVMSG #rust :hi there");
        assert_eq!(Message::new("JOIN", ["#rust"]).to_string(), "JOIN #rust");
        assert_eq!(Message::new("PRIVMSG", ["bob", ":)"]).to_string(), "PRIVMSG bob ::)");
        assert_eq!(Message::new("AWAY", [""]).to_string(), "AWAY :");
    }

    #[test]
    fn format_strips_line_breaks() {
        let line = Message::new("PRIVMSG", ["#rust", "hi\r\nQUIT :pwned"]).to_string();
        assert!(!line.contains('\n') && !line.contains('\r'));
    }
}
