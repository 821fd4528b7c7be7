//! Broadcast decisions.
//!
//! [`dispatch`] turns one inbound event into the outbound events it causes,
//! updating the [`SessionRegistry`] along the way. It performs no I/O, so the
//! whole fan-out policy can be tested without sockets; the broker publishes
//! the returned envelopes in order.

use crate::{
    message::{ClientEvent, ServerEvent},
    registry::{ConnectionId, SessionRegistry},
};

pub const REJECT_UNREGISTERED: &str = "Please set a username before sending messages.";

/// Everything that can happen to a connection, including it going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    SetUsername(String),
    ChatMessage(String),
    TypingStarted,
    TypingStopped,
    Disconnect,
}

impl From<ClientEvent> for Inbound {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::SetUsername(name) => Self::SetUsername(name),
            ClientEvent::ChatMessage(text) => Self::ChatMessage(text),
            ClientEvent::Typing => Self::TypingStarted,
            ClientEvent::StopTyping => Self::TypingStopped,
        }
    }
}

/// Which connections an outbound event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    /// Everyone except the given connection.
    Others(ConnectionId),
    Only(ConnectionId),
}

impl Audience {
    pub fn includes(self, id: ConnectionId) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::Others(excluded) => excluded != id,
            Audience::Only(target) => target == id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn everyone(event: ServerEvent) -> Self {
        Self {
            audience: Audience::Everyone,
            event,
        }
    }

    pub fn others(sender: ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::Others(sender),
            event,
        }
    }

    pub fn only(target: ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::Only(target),
            event,
        }
    }
}

/// Result of handling one inbound event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Outbound events, in the order they must be published.
    pub envelopes: Vec<Envelope>,
    /// Set when the sender just became named and is owed a welcome.
    pub schedule_welcome: bool,
}

impl Outcome {
    fn push(&mut self, envelope: Envelope) {
        self.envelopes.push(envelope);
    }
}

pub fn dispatch(registry: &mut SessionRegistry, from: ConnectionId, event: Inbound) -> Outcome {
    match event {
        Inbound::SetUsername(name) => set_username(registry, from, name),
        Inbound::ChatMessage(text) => chat_message(registry, from, text),
        Inbound::TypingStarted => typing(registry, from, true),
        Inbound::TypingStopped => typing(registry, from, false),
        Inbound::Disconnect => disconnect(registry, from),
    }
}

fn set_username(registry: &mut SessionRegistry, from: ConnectionId, name: String) -> Outcome {
    let was_anonymous = registry.username(from).is_none();
    registry.set_username(from, name.clone());

    let mut outcome = Outcome {
        schedule_welcome: was_anonymous,
        ..Outcome::default()
    };
    outcome.push(Envelope::others(
        from,
        ServerEvent::system(format!("{name} has joined the chat!")),
    ));
    outcome.push(Envelope::everyone(ServerEvent::UserListUpdate(
        registry.usernames(),
    )));
    outcome
}

fn chat_message(registry: &mut SessionRegistry, from: ConnectionId, text: String) -> Outcome {
    let mut outcome = Outcome::default();
    let Some(user) = registry.username(from).map(str::to_owned) else {
        outcome.push(Envelope::only(from, ServerEvent::system(REJECT_UNREGISTERED)));
        return outcome;
    };

    if registry.set_typing(from, false) {
        outcome.push(Envelope::others(
            from,
            ServerEvent::UserStoppedTyping(user.clone()),
        ));
    }
    outcome.push(Envelope::everyone(ServerEvent::ChatMessage { user, msg: text }));
    outcome
}

fn typing(registry: &mut SessionRegistry, from: ConnectionId, typing: bool) -> Outcome {
    let mut outcome = Outcome::default();
    let Some(user) = registry.username(from).map(str::to_owned) else {
        return outcome;
    };

    if registry.set_typing(from, typing) {
        let event = if typing {
            ServerEvent::UserTyping(user)
        } else {
            ServerEvent::UserStoppedTyping(user)
        };
        outcome.push(Envelope::others(from, event));
    }
    outcome
}

fn disconnect(registry: &mut SessionRegistry, from: ConnectionId) -> Outcome {
    let mut outcome = Outcome::default();
    let Some(session) = registry.remove(from) else {
        return outcome;
    };
    let Some(user) = session.username else {
        return outcome;
    };

    // The departure notice goes out before the shrunken user list.
    outcome.push(Envelope::others(
        from,
        ServerEvent::system(format!("{user} has left the chat.")),
    ));
    outcome.push(Envelope::everyone(ServerEvent::UserListUpdate(
        registry.usernames(),
    )));
    if session.typing {
        outcome.push(Envelope::others(from, ServerEvent::UserStoppedTyping(user)));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> ConnectionId {
        ConnectionId::new(raw)
    }

    fn registry_with(names: &[(u64, Option<&str>)]) -> SessionRegistry {
        let mut registry = SessionRegistry::new();
        for (raw, name) in names {
            registry.open(id(*raw));
            if let Some(name) = name {
                registry.set_username(id(*raw), (*name).to_string());
            }
        }
        registry
    }

    #[test]
    fn set_username_announces_and_schedules_welcome() {
        let mut registry = registry_with(&[(1, Some("alice")), (2, None)]);

        let outcome = dispatch(&mut registry, id(2), Inbound::SetUsername("bob".into()));

        assert!(outcome.schedule_welcome);
        assert_eq!(
            outcome.envelopes,
            vec![
                Envelope::others(id(2), ServerEvent::system("bob has joined the chat!")),
                Envelope::everyone(ServerEvent::UserListUpdate(vec![
                    "alice".into(),
                    "bob".into()
                ])),
            ]
        );
    }

    #[test]
    fn renaming_does_not_schedule_a_second_welcome() {
        let mut registry = registry_with(&[(1, Some("alice"))]);

        let outcome = dispatch(&mut registry, id(1), Inbound::SetUsername("alicia".into()));

        assert!(!outcome.schedule_welcome);
        assert_eq!(registry.usernames(), vec!["alicia"]);
    }

    #[test]
    fn n_registrations_list_n_names_even_when_duplicated() {
        let mut registry = registry_with(&[(1, None), (2, None), (3, None)]);
        for raw in 1..=3 {
            dispatch(&mut registry, id(raw), Inbound::SetUsername("sam".into()));
        }

        assert_eq!(registry.usernames(), vec!["sam", "sam", "sam"]);
    }

    #[test]
    fn anonymous_chat_is_rejected_privately() {
        let mut registry = registry_with(&[(1, None), (2, Some("bob"))]);

        let outcome = dispatch(&mut registry, id(1), Inbound::ChatMessage("hello?".into()));

        assert!(!outcome.schedule_welcome);
        assert_eq!(
            outcome.envelopes,
            vec![Envelope::only(id(1), ServerEvent::system(REJECT_UNREGISTERED))]
        );
        assert!(
            outcome
                .envelopes
                .iter()
                .all(|envelope| !envelope.audience.includes(id(2)))
        );
    }

    #[test]
    fn chat_is_broadcast_to_everyone_and_clears_typing() {
        let mut registry = registry_with(&[(1, Some("alice")), (2, Some("bob"))]);
        dispatch(&mut registry, id(1), Inbound::TypingStarted);

        let outcome = dispatch(&mut registry, id(1), Inbound::ChatMessage("hi".into()));

        assert_eq!(
            outcome.envelopes,
            vec![
                Envelope::others(id(1), ServerEvent::UserStoppedTyping("alice".into())),
                Envelope::everyone(ServerEvent::ChatMessage {
                    user: "alice".into(),
                    msg: "hi".into()
                }),
            ]
        );
        assert!(!registry.is_typing(id(1)));
    }

    #[test]
    fn typing_start_twice_notifies_once() {
        let mut registry = registry_with(&[(1, Some("alice"))]);

        let first = dispatch(&mut registry, id(1), Inbound::TypingStarted);
        let second = dispatch(&mut registry, id(1), Inbound::TypingStarted);

        assert_eq!(
            first.envelopes,
            vec![Envelope::others(id(1), ServerEvent::UserTyping("alice".into()))]
        );
        assert!(second.envelopes.is_empty());
    }

    #[test]
    fn typing_stop_after_chat_is_silent() {
        let mut registry = registry_with(&[(1, Some("alice"))]);
        dispatch(&mut registry, id(1), Inbound::TypingStarted);
        dispatch(&mut registry, id(1), Inbound::ChatMessage("done".into()));

        let outcome = dispatch(&mut registry, id(1), Inbound::TypingStopped);

        assert!(outcome.envelopes.is_empty());
    }

    #[test]
    fn typing_from_anonymous_connection_is_ignored() {
        let mut registry = registry_with(&[(1, None)]);

        assert!(dispatch(&mut registry, id(1), Inbound::TypingStarted).envelopes.is_empty());
        assert!(!registry.is_typing(id(1)));
    }

    #[test]
    fn disconnect_announces_departure_before_list() {
        let mut registry = registry_with(&[(1, Some("alice")), (2, Some("bob"))]);
        dispatch(&mut registry, id(1), Inbound::TypingStarted);

        let outcome = dispatch(&mut registry, id(1), Inbound::Disconnect);

        assert_eq!(
            outcome.envelopes,
            vec![
                Envelope::others(id(1), ServerEvent::system("alice has left the chat.")),
                Envelope::everyone(ServerEvent::UserListUpdate(vec!["bob".into()])),
                Envelope::others(id(1), ServerEvent::UserStoppedTyping("alice".into())),
            ]
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disconnect_without_typing_skips_stopped_notice() {
        let mut registry = registry_with(&[(1, Some("alice")), (2, Some("bob"))]);

        let outcome = dispatch(&mut registry, id(2), Inbound::Disconnect);

        assert_eq!(outcome.envelopes.len(), 2);
    }

    #[test]
    fn anonymous_or_unknown_disconnect_is_silent() {
        let mut registry = registry_with(&[(1, None), (2, Some("bob"))]);

        assert_eq!(dispatch(&mut registry, id(1), Inbound::Disconnect), Outcome::default());
        assert_eq!(dispatch(&mut registry, id(7), Inbound::Disconnect), Outcome::default());
        assert_eq!(registry.usernames(), vec!["bob"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn audience_filters_recipients() {
        assert!(Audience::Everyone.includes(id(1)));
        assert!(!Audience::Others(id(1)).includes(id(1)));
        assert!(Audience::Others(id(1)).includes(id(2)));
        assert!(Audience::Only(id(1)).includes(id(1)));
        assert!(!Audience::Only(id(1)).includes(id(2)));
    }
}
