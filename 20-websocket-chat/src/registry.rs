use std::{collections::BTreeMap, fmt};

/// Transport-assigned identity of one client connection.
///
/// Ids are handed out in increasing order, so iterating sessions by id
/// walks them in the order the clients connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Server-side state of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub username: Option<String>,
    pub typing: bool,
}

/// Username and typing state for every open connection.
///
/// The registry itself is plain data; callers serialize access to it
/// (the broker keeps it behind a single mutex).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an anonymous session. Re-opening an existing id leaves it untouched.
    pub fn open(&mut self, id: ConnectionId) {
        self.sessions.entry(id).or_default();
    }

    /// Stores `name` for `id`, silently replacing any previous name.
    ///
    /// Names are neither validated nor required to be unique.
    pub fn set_username(&mut self, id: ConnectionId, name: String) {
        self.sessions.entry(id).or_default().username = Some(name);
    }

    pub fn username(&self, id: ConnectionId) -> Option<&str> {
        self.sessions
            .get(&id)
            .and_then(|session| session.username.as_deref())
    }

    pub fn is_typing(&self, id: ConnectionId) -> bool {
        self.sessions.get(&id).is_some_and(|session| session.typing)
    }

    /// Updates the typing flag and reports whether it actually changed.
    ///
    /// Unknown connections are left alone and report `false`.
    pub fn set_typing(&mut self, id: ConnectionId, typing: bool) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.typing != typing => {
                session.typing = typing;
                true
            }
            _ => false,
        }
    }

    /// Drops every trace of `id`; removing an unknown id is a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Names of all registered sessions in connection order, duplicates included.
    pub fn usernames(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter_map(|session| session.username.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
