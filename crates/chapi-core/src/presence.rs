//! Presence notifications: the internal `POST`s a channel service makes when
//! a client attaches or detaches its channel.

use crate::client_id::ClientId;

/// Path prefix of "client attached" notifications.
pub const CONNECTED_PATH: &str = "/_ah/channel/connected/";
/// Path prefix of "client detached" notifications.
pub const DISCONNECTED_PATH: &str = "/_ah/channel/disconnected/";

/// Form field naming the client in a presence body.
const FROM_FIELD: &str = "from";

/// What kind of presence notification a request is, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    None,
    Connected,
    Disconnected,
}

impl PresenceKind {
    pub fn is_presence(self) -> bool {
        self != PresenceKind::None
    }

    /// Path a channel service posts this notification to.
    pub fn path(self) -> Option<&'static str> {
        match self {
            PresenceKind::None => None,
            PresenceKind::Connected => Some(CONNECTED_PATH),
            PresenceKind::Disconnected => Some(DISCONNECTED_PATH),
        }
    }
}

/// Classify an inbound request by method and full request path.
pub fn classify(method: &str, path: &str) -> PresenceKind {
    if method != "POST" {
        return PresenceKind::None;
    }
    if path.starts_with(CONNECTED_PATH) {
        PresenceKind::Connected
    } else if path.starts_with(DISCONNECTED_PATH) {
        PresenceKind::Disconnected
    } else {
        PresenceKind::None
    }
}

/// A parsed presence notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub client_id: ClientId,
    pub connected: bool,
}

/// Parse a form-encoded presence body (`from=<client id>`).
///
/// A body without a usable `from` field is not a presence event; callers
/// skip it rather than failing the request.
pub fn parse_presence_form(kind: PresenceKind, body: &[u8]) -> Option<PresenceEvent> {
    let connected = match kind {
        PresenceKind::None => return None,
        PresenceKind::Connected => true,
        PresenceKind::Disconnected => false,
    };

    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == FROM_FIELD)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| PresenceEvent {
            client_id: ClientId::new(value),
            connected,
        })
}

/// Build the form body a channel service posts for `client_id`.
pub fn presence_form(client_id: &ClientId) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair(FROM_FIELD, client_id.as_str())
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_post_is_eligible() {
        assert_eq!(classify("GET", "/_ah/channel/connected/"), PresenceKind::None);
        assert_eq!(classify("PUT", "/_ah/channel/disconnected/"), PresenceKind::None);
        assert_eq!(classify("post", "/_ah/channel/connected/"), PresenceKind::None);
    }

    #[test]
    fn classifies_by_prefix() {
        assert_eq!(classify("POST", "/_ah/channel/connected/"), PresenceKind::Connected);
        assert_eq!(classify("POST", "/_ah/channel/connected/extra"), PresenceKind::Connected);
        assert_eq!(
            classify("POST", "/_ah/channel/disconnected/"),
            PresenceKind::Disconnected
        );
        assert_eq!(classify("POST", "/_ah/channel/connected"), PresenceKind::None);
        assert_eq!(classify("POST", "/app/feed"), PresenceKind::None);
        assert!(!classify("POST", "/").is_presence());
    }

    #[test]
    fn parses_from_field() {
        let event = parse_presence_form(PresenceKind::Connected, b"from=abc&x=1").unwrap();
        assert_eq!(event.client_id.as_str(), "abc");
        assert!(event.connected);

        let event = parse_presence_form(PresenceKind::Disconnected, b"from=a%20b").unwrap();
        assert_eq!(event.client_id.as_str(), "a b");
        assert!(!event.connected);
    }

    #[test]
    fn empty_or_foreign_bodies_are_not_events() {
        assert!(parse_presence_form(PresenceKind::Connected, b"").is_none());
        assert!(parse_presence_form(PresenceKind::Connected, b"from=").is_none());
        assert!(parse_presence_form(PresenceKind::Connected, b"to=abc").is_none());
        assert!(parse_presence_form(PresenceKind::None, b"from=abc").is_none());
    }

    #[test]
    fn form_round_trips_through_parser() {
        let id = ClientId::new("id with&symbols=");
        let body = presence_form(&id);
        let event = parse_presence_form(PresenceKind::Connected, body.as_bytes()).unwrap();
        assert_eq!(event.client_id, id);
        assert_eq!(PresenceKind::Connected.path(), Some(CONNECTED_PATH));
    }
}
