//! Channels and their rosters.
//!
//! Only the reducer mutates these. Channel names are compared with exact
//! string equality; no case folding is applied.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::MemberSnapshot;

/// Channel privilege levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    Owner,
    Admin,
    Op,
    Halfop,
    Voice,
}

impl UserMode {
    /// Map either a mode letter (`o`) or a display prefix (`@`).
    pub fn from_marker(c: char) -> Option<Self> {
        match c {
            'q' | '~' => Some(UserMode::Owner),
            'a' | '&' => Some(UserMode::Admin),
            'o' | '@' => Some(UserMode::Op),
            'h' | '%' => Some(UserMode::Halfop),
            'v' | '+' => Some(UserMode::Voice),
            _ => None,
        }
    }

    pub fn prefix(self) -> char {
        match self {
            UserMode::Owner => '~',
            UserMode::Admin => '&',
            UserMode::Op => '@',
            UserMode::Halfop => '%',
            UserMode::Voice => '+',
        }
    }

    /// Parse a marker string; unrecognized characters are ignored.
    pub fn parse_set(markers: &str) -> BTreeSet<UserMode> {
        markers.chars().filter_map(UserMode::from_marker).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelUser {
    pub nickname: String,
    pub modes: BTreeSet<UserMode>,
    pub is_away: bool,
    pub away_message: Option<String>,
}

impl ChannelUser {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            modes: BTreeSet::new(),
            is_away: false,
            away_message: None,
        }
    }

    /// Highest privilege prefix, e.g. `@` for an op who is also voiced.
    pub fn prefix(&self) -> Option<char> {
        self.modes.iter().next().map(|m| m.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Channel,
    Query,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub name: String,
    pub display_name: Option<String>,
    pub kind: ChannelKind,
    pub topic: Option<String>,
    /// Keyed by nickname.
    pub users: BTreeMap<String, ChannelUser>,
    pub unread_count: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            kind,
            topic: None,
            users: BTreeMap::new(),
            unread_count: 0,
            last_activity: None,
        }
    }

    pub fn has_user(&self, nickname: &str) -> bool {
        self.users.contains_key(nickname)
    }

    /// Insert or update one user's mode set, keeping away state.
    pub fn upsert_user(&mut self, nickname: &str, modes: BTreeSet<UserMode>) {
        self.users
            .entry(nickname.to_string())
            .or_insert_with(|| ChannelUser::new(nickname))
            .modes = modes;
    }

    pub fn remove_user(&mut self, nickname: &str) -> Option<ChannelUser> {
        self.users.remove(nickname)
    }

    /// Rename a member, keeping modes and away state. Returns false when
    /// `old` is not present.
    pub fn rename_user(&mut self, old: &str, new: &str) -> bool {
        let Some(mut user) = self.users.remove(old) else {
            return false;
        };
        user.nickname = new.to_string();
        self.users.insert(new.to_string(), user);
        true
    }

    pub fn set_topic(&mut self, topic: Option<String>) {
        self.topic = topic;
    }

    /// Apply an authoritative roster snapshot: every listed user gets the
    /// snapshot's modes, anyone not listed is removed, away state of
    /// surviving users is kept. Applying the same snapshot twice is a no-op.
    pub fn sync_users(&mut self, snapshot: &[MemberSnapshot]) {
        let listed: HashMap<&str, &MemberSnapshot> =
            snapshot.iter().map(|m| (m.nickname.as_str(), m)).collect();
        self.users.retain(|nick, _| listed.contains_key(nick.as_str()));
        for member in snapshot {
            if member.nickname.is_empty() {
                continue;
            }
            self.upsert_user(&member.nickname, UserMode::parse_set(&member.modes));
        }
    }

    pub fn set_away(&mut self, nickname: &str, message: Option<&str>) -> bool {
        let Some(user) = self.users.get_mut(nickname) else {
            return false;
        };
        user.is_away = message.is_some();
        user.away_message = message.map(String::from);
        true
    }
}

/// The session's channel map. Entries are shared between clones and copied
/// on first write, so cloning the map does not copy any roster.
#[derive(Debug, Clone, Default)]
pub struct Channels {
    map: BTreeMap<String, Arc<Channel>>,
}

impl Channels {
    /// Create the entry for `name`, replacing any previous one.
    pub fn create_or_replace(&mut self, name: &str, kind: ChannelKind) -> &mut Channel {
        let slot = self.ensure(name, kind);
        *slot = Channel::new(name, kind);
        slot
    }

    /// Get the entry for `name`, creating it if absent.
    pub fn ensure(&mut self, name: &str, kind: ChannelKind) -> &mut Channel {
        let entry = self.map.entry(name.to_string()).or_insert_with(|| Arc::new(Channel::new(name, kind)));
        Arc::make_mut(entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.map.remove(name).map(Arc::unwrap_or_clone)
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.map.get(name).map(Arc::as_ref)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.map.get_mut(name).map(Arc::make_mut)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.map.values().map(Arc::as_ref)
    }

    /// Names of channels (not queries or server buffers) where `nickname`
    /// is a member, in name order.
    pub fn containing(&self, nickname: &str) -> Vec<String> {
        self.map
            .values()
            .filter(|c| c.kind == ChannelKind::Channel && c.has_user(nickname))
            .map(|c| c.name.clone())
            .collect()
    }
}
