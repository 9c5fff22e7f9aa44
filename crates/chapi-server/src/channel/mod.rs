//! Channel service: issues tokens, delivers framed text to a client's
//! channel, and parses presence notifications.
//!
//! The bridge only talks to the service through [`ChannelService`].
//! [`LocalChannelService`] is the in-process implementation the server runs
//! with; its clients attach through `GET /_ah/channel/open`.

pub mod local;
#[cfg(test)]
pub mod mock;

pub use local::LocalChannelService;

use async_trait::async_trait;
use chapi_core::{ChapiResult, ClientId, PresenceEvent, PresenceKind};

#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Issue a channel token for `client_id`. `None` means the service could
    /// not create a channel.
    async fn issue_token(&self, client_id: &ClientId) -> Option<String>;

    /// Release a token whose suspend episode has ended. It no longer counts
    /// against the channel limit and cannot open a channel.
    async fn revoke_token(&self, client_id: &ClientId, token: &str);

    /// Deliver one already-framed payload to the client's channel.
    async fn deliver(&self, client_id: &ClientId, payload: String) -> ChapiResult<()>;

    /// Parse the body of a presence notification.
    fn parse_presence(&self, kind: PresenceKind, body: &[u8]) -> Option<PresenceEvent>;
}
