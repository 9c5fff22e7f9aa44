//! In-process channel service.
//!
//! Tokens are HMAC-signed with a per-process secret and mapped back to the
//! client they were issued for. Each client has at most one subscriber: a
//! bounded queue drained by its `GET /_ah/channel/open` stream.

use super::ChannelService;
use crate::config::ServerConfig;
use async_trait::async_trait;
use chapi_core::presence::parse_presence_form;
use chapi_core::{
    create_token, generate_secret, verify_token, ChapiError, ChapiResult, ClientId, PresenceEvent,
    PresenceKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// An open channel: the receiving end of a client's delivery queue.
pub struct Subscription {
    pub client_id: ClientId,
    /// Distinguishes this subscription from later ones for the same client.
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

pub struct LocalChannelService {
    secret: Vec<u8>,
    token_ttl: u64,
    queue_capacity: usize,
    max_channels: usize,
    /// Live tokens, mapped to the client each was issued for.
    tokens: RwLock<HashMap<String, ClientId>>,
    subscribers: RwLock<HashMap<ClientId, Subscriber>>,
    next_subscription: AtomicU64,
}

impl LocalChannelService {
    pub fn new(secret: Vec<u8>, token_ttl: u64, queue_capacity: usize, max_channels: usize) -> Self {
        Self {
            secret,
            token_ttl,
            queue_capacity,
            max_channels,
            tokens: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Build from server config with a fresh random secret.
    pub fn from_config(config: &ServerConfig) -> ChapiResult<Self> {
        Ok(Self::new(
            generate_secret()?,
            config.token_ttl,
            config.queue_capacity,
            config.max_channels,
        ))
    }

    /// Attach a channel client presenting `token`.
    ///
    /// Replaces any subscriber already attached for the same client.
    pub async fn open(&self, token: &str) -> ChapiResult<Subscription> {
        let client_id = self
            .tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| ChapiError::Token("unknown channel token".into()))?;
        verify_token(&self.secret, client_id.as_str(), token)?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write().await;
        if subscribers.insert(client_id.clone(), Subscriber { id, tx }).is_some() {
            debug!(client_id = %client_id.short(), "replaced channel subscriber");
        }
        info!(client_id = %client_id.short(), subscription = id, "channel opened");

        Ok(Subscription { client_id, id, rx })
    }

    /// Detach subscription `id` of `client_id`.
    ///
    /// Returns false when a newer subscription has taken its place, in which
    /// case the client is still attached.
    pub async fn close(&self, client_id: &ClientId, id: u64) -> bool {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.get(client_id) {
            Some(sub) if sub.id == id => {
                subscribers.remove(client_id);
                info!(client_id = %client_id.short(), subscription = id, "channel closed");
                true
            }
            _ => false,
        }
    }

    /// Detach every subscriber. Queued frames are still drained by their
    /// streams before those end.
    pub async fn close_all(&self) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    /// Whether a subscriber is attached for `client_id`.
    #[cfg(test)]
    pub async fn is_open(&self, client_id: &ClientId) -> bool {
        self.subscribers.read().await.contains_key(client_id)
    }

    /// Number of unexpired tokens.
    #[cfg(test)]
    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[async_trait]
impl ChannelService for LocalChannelService {
    async fn issue_token(&self, client_id: &ClientId) -> Option<String> {
        let mut tokens = self.tokens.write().await;
        tokens.retain(|token, owner| verify_token(&self.secret, owner.as_str(), token).is_ok());

        if tokens.len() >= self.max_channels {
            warn!(
                client_id = %client_id.short(),
                max_channels = self.max_channels,
                "channel limit reached, refusing token"
            );
            return None;
        }

        match create_token(&self.secret, client_id.as_str(), self.token_ttl) {
            Ok(token) => {
                tokens.insert(token.clone(), client_id.clone());
                Some(token)
            }
            Err(e) => {
                error!(client_id = %client_id.short(), error = %e, "token creation failed");
                None
            }
        }
    }

    async fn revoke_token(&self, client_id: &ClientId, token: &str) {
        let mut tokens = self.tokens.write().await;
        if tokens.get(token) == Some(client_id) {
            tokens.remove(token);
            debug!(client_id = %client_id.short(), "channel token revoked");
        }
    }

    async fn deliver(&self, client_id: &ClientId, payload: String) -> ChapiResult<()> {
        let subscribers = self.subscribers.read().await;
        let sub = subscribers.get(client_id).ok_or_else(|| ChapiError::Delivery {
            client_id: client_id.to_string(),
            reason: "channel not open".into(),
        })?;

        sub.tx.try_send(payload).map_err(|e| ChapiError::Delivery {
            client_id: client_id.to_string(),
            reason: match e {
                TrySendError::Full(_) => "channel queue full".into(),
                TrySendError::Closed(_) => "channel closed".into(),
            },
        })
    }

    fn parse_presence(&self, kind: PresenceKind, body: &[u8]) -> Option<PresenceEvent> {
        parse_presence_form(kind, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(max_channels: usize) -> LocalChannelService {
        LocalChannelService::new(generate_secret().unwrap(), 3600, 4, max_channels)
    }

    #[tokio::test]
    async fn token_opens_channel_for_its_client() {
        let svc = service(10);
        let id = ClientId::new("c1");
        let token = svc.issue_token(&id).await.unwrap();

        let mut sub = svc.open(&token).await.unwrap();
        assert_eq!(sub.client_id, id);
        assert!(svc.is_open(&id).await);

        svc.deliver(&id, "message:l=2;hi".into()).await.unwrap();
        assert_eq!(sub.rx.recv().await.unwrap(), "message:l=2;hi");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let svc = service(10);
        assert!(matches!(svc.open("deadbeef").await, Err(ChapiError::Token(_))));
    }

    #[tokio::test]
    async fn deliver_without_subscriber_fails() {
        let svc = service(10);
        let err = svc.deliver(&ClientId::new("nobody"), "x".into()).await.unwrap_err();
        assert!(err.to_string().contains("channel not open"));
    }

    #[tokio::test]
    async fn full_queue_reports_failure() {
        let svc = service(10);
        let id = ClientId::new("c1");
        let token = svc.issue_token(&id).await.unwrap();
        let _sub = svc.open(&token).await.unwrap();

        for i in 0..4 {
            svc.deliver(&id, format!("m{i}")).await.unwrap();
        }
        let err = svc.deliver(&id, "overflow".into()).await.unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }

    #[tokio::test]
    async fn channel_limit_refuses_tokens() {
        let svc = service(2);
        assert!(svc.issue_token(&ClientId::new("a")).await.is_some());
        assert!(svc.issue_token(&ClientId::new("b")).await.is_some());
        assert!(svc.issue_token(&ClientId::new("c")).await.is_none());
        assert_eq!(svc.token_count().await, 2);
    }

    #[tokio::test]
    async fn stale_close_keeps_newer_subscriber() {
        let svc = service(10);
        let id = ClientId::new("c1");
        let token = svc.issue_token(&id).await.unwrap();

        let first = svc.open(&token).await.unwrap();
        let second = svc.open(&token).await.unwrap();

        assert!(!svc.close(&id, first.id).await);
        assert!(svc.is_open(&id).await);
        assert!(svc.close(&id, second.id).await);
        assert!(!svc.is_open(&id).await);
    }

    #[tokio::test]
    async fn revoked_token_frees_its_slot_and_stops_opening() {
        let svc = service(1);
        let id = ClientId::new("c1");
        let first = svc.issue_token(&id).await.unwrap();
        assert!(svc.issue_token(&id).await.is_none());

        svc.revoke_token(&ClientId::new("other"), &first).await;
        assert_eq!(svc.token_count().await, 1);

        svc.revoke_token(&id, &first).await;
        assert_eq!(svc.token_count().await, 0);
        assert!(matches!(svc.open(&first).await, Err(ChapiError::Token(_))));
        assert!(svc.issue_token(&id).await.is_some());
    }

    #[tokio::test]
    async fn close_all_drains_then_ends_streams() {
        let svc = service(10);
        let id = ClientId::new("c1");
        let token = svc.issue_token(&id).await.unwrap();
        let mut sub = svc.open(&token).await.unwrap();

        svc.deliver(&id, "disconnect;".into()).await.unwrap();
        assert_eq!(svc.close_all().await, 1);
        assert_eq!(sub.rx.recv().await.as_deref(), Some("disconnect;"));
        assert!(sub.rx.recv().await.is_none());
    }

    #[test]
    fn parses_form_presence() {
        let svc = service(1);
        let event = svc
            .parse_presence(PresenceKind::Disconnected, b"from=c9")
            .unwrap();
        assert_eq!(event.client_id, ClientId::new("c9"));
        assert!(!event.connected);
    }
}
