//! The transport's own view of channel membership.
//!
//! Kept current from the wire (NAMES, JOIN, PART, KICK, QUIT, NICK, MODE)
//! before the corresponding event is delivered, so the session can re-sync
//! from it at any time. Member modes are stored as mode letters in rank order
//! (`"ov"`), the form `palaver_core::roster::UserMode::parse_set` accepts.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use palaver_core::event::MemberSnapshot;
use palaver_core::transport::RosterSource;

/// ISUPPORT `PREFIX`: member mode letters and their display symbols,
/// highest rank first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMap {
    pairs: Vec<(char, char)>,
}

impl Default for PrefixMap {
    fn default() -> Self {
        Self::parse("(qaohv)~&@%+").unwrap_or(Self { pairs: Vec::new() })
    }
}

impl PrefixMap {
    /// Parse the value of `PREFIX=`, e.g. `(ov)@+`.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('(')?;
        let (letters, symbols) = rest.split_once(')')?;
        if letters.chars().count() != symbols.chars().count() {
            return None;
        }
        Some(Self { pairs: letters.chars().zip(symbols.chars()).collect() })
    }

    pub fn is_prefix_mode(&self, letter: char) -> bool {
        self.pairs.iter().any(|(l, _)| *l == letter)
    }

    fn letter_for(&self, symbol: char) -> Option<char> {
        self.pairs.iter().find(|(_, s)| *s == symbol).map(|(l, _)| *l)
    }

    fn rank(&self, letter: char) -> usize {
        self.pairs.iter().position(|(l, _)| *l == letter).unwrap_or(usize::MAX)
    }

    /// Split a NAMES entry into mode letters and nick. Handles multi-prefix.
    pub fn split_name<'a>(&self, entry: &'a str) -> (String, &'a str) {
        let mut letters = String::new();
        let mut nick = entry;
        while let Some(c) = nick.chars().next() {
            match self.letter_for(c) {
                Some(l) => {
                    letters.push(l);
                    nick = &nick[c.len_utf8()..];
                }
                None => break,
            }
        }
        // userhost-in-names
        let nick = nick.split('!').next().unwrap_or(nick);
        (self.normalize(&letters), nick)
    }

    /// Dedupe and order letters by rank.
    fn normalize(&self, letters: &str) -> String {
        let mut v: Vec<char> = letters.chars().filter(|c| self.is_prefix_mode(*c)).collect();
        v.sort_by_key(|c| self.rank(*c));
        v.dedup();
        v.into_iter().collect()
    }
}

/// ISUPPORT `CHANMODES=A,B,C,D`: which non-member modes take a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChanModes {
    /// Lists (ban, except, invex): parameter on set and unset.
    list: String,
    /// Always a parameter (key).
    always: String,
    /// Parameter only when set (limit).
    on_set: String,
}

impl Default for ChanModes {
    fn default() -> Self {
        Self::parse("beI,k,l,imnpst")
    }
}

impl ChanModes {
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(',');
        let mut next = || parts.next().unwrap_or_default().to_string();
        Self { list: next(), always: next(), on_set: next() }
    }

    fn takes_param(&self, letter: char, adding: bool) -> bool {
        self.list.contains(letter) || self.always.contains(letter) || (adding && self.on_set.contains(letter))
    }
}

#[derive(Debug, Default)]
struct Inner {
    prefixes: PrefixMap,
    chanmodes: ChanModes,
    /// channel → nick → mode letters
    channels: HashMap<String, BTreeMap<String, String>>,
    /// NAMES replies received but not yet terminated by 366.
    pending: HashMap<String, BTreeMap<String, String>>,
}

/// Thread-safe roster shared between the read loop and the session.
#[derive(Debug, Default)]
pub struct RosterCache {
    inner: RwLock<Inner>,
}

impl RosterCache {
    pub fn set_prefixes(&self, prefixes: PrefixMap) {
        self.inner.write().prefixes = prefixes;
    }

    pub fn set_chanmodes(&self, chanmodes: ChanModes) {
        self.inner.write().chanmodes = chanmodes;
    }

    /// We joined `channel`: start from an empty roster until NAMES arrives.
    pub fn joined(&self, channel: &str, own_nick: &str) {
        let mut inner = self.inner.write();
        let members = inner.channels.entry(channel.to_string()).or_default();
        members.clear();
        members.insert(own_nick.to_string(), String::new());
    }

    pub fn add(&self, channel: &str, nick: &str) {
        if let Some(members) = self.inner.write().channels.get_mut(channel) {
            members.entry(nick.to_string()).or_default();
        }
    }

    pub fn remove(&self, channel: &str, nick: &str) {
        if let Some(members) = self.inner.write().channels.get_mut(channel) {
            members.remove(nick);
        }
    }

    pub fn forget(&self, channel: &str) {
        let mut inner = self.inner.write();
        inner.channels.remove(channel);
        inner.pending.remove(channel);
    }

    /// Remove `nick` everywhere; returns the channels it was in.
    pub fn quit(&self, nick: &str) -> Vec<String> {
        let mut inner = self.inner.write();
        let mut out: Vec<String> = inner
            .channels
            .iter_mut()
            .filter_map(|(name, members)| members.remove(nick).map(|_| name.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn rename(&self, old: &str, new: &str) {
        let mut inner = self.inner.write();
        for members in inner.channels.values_mut() {
            if let Some(modes) = members.remove(old) {
                members.insert(new.to_string(), modes);
            }
        }
    }

    /// Accumulate one 353 line.
    pub fn names(&self, channel: &str, entries: &str) {
        let mut inner = self.inner.write();
        let parsed: Vec<(String, String)> = entries
            .split_whitespace()
            .map(|e| {
                let (letters, nick) = inner.prefixes.split_name(e);
                (nick.to_string(), letters)
            })
            .filter(|(nick, _)| !nick.is_empty())
            .collect();
        inner.pending.entry(channel.to_string()).or_default().extend(parsed);
    }

    /// 366: return the accumulated NAMES. They replace the stored roster
    /// only for channels we are in.
    pub fn end_names(&self, channel: &str) -> Option<Vec<MemberSnapshot>> {
        let mut inner = self.inner.write();
        let members = inner.pending.remove(channel)?;
        let snapshot: Vec<MemberSnapshot> = members.iter().map(|(n, m)| MemberSnapshot::new(n.as_str(), m.as_str())).collect();
        if let Some(stored) = inner.channels.get_mut(channel) {
            *stored = members;
        }
        Some(snapshot)
    }

    /// Apply a channel MODE change. Returns true if member modes moved.
    pub fn apply_mode(&self, channel: &str, modes: &str, args: &[String]) -> bool {
        let mut inner = self.inner.write();
        let Inner { prefixes, chanmodes, channels, .. } = &mut *inner;
        let Some(members) = channels.get_mut(channel) else {
            return false;
        };
        let mut args = args.iter();
        let mut adding = true;
        let mut changed = false;
        for c in modes.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                letter if prefixes.is_prefix_mode(letter) => {
                    let Some(nick) = args.next() else { break };
                    if let Some(current) = members.get_mut(nick.as_str()) {
                        let mut next: String = current.chars().filter(|l| *l != letter).collect();
                        if adding {
                            next.push(letter);
                        }
                        *current = prefixes.normalize(&next);
                        changed = true;
                    }
                }
                letter if chanmodes.takes_param(letter, adding) => {
                    args.next();
                }
                _ => {}
            }
        }
        changed
    }

    pub fn snapshot(&self, channel: &str) -> Option<Vec<MemberSnapshot>> {
        let inner = self.inner.read();
        inner
            .channels
            .get(channel)
            .map(|members| members.iter().map(|(n, m)| MemberSnapshot::new(n.as_str(), m.as_str())).collect())
    }
}

impl RosterSource for RosterCache {
    fn roster(&self, channel: &str) -> Option<Vec<MemberSnapshot>> {
        self.snapshot(channel)
    }
}
