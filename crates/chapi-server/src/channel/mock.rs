use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::*;
use chapi_core::presence::parse_presence_form;
use chapi_core::ChapiError;

/// A channel service for tests. Issues sequential tokens and records every
/// delivery instead of sending it anywhere.
#[derive(Default)]
pub struct RecordingChannel {
    next_token: AtomicU64,
    refuse_tokens: AtomicBool,
    fail_deliveries: AtomicBool,
    issued: Mutex<Vec<(ClientId, String)>>,
    revoked: Mutex<Vec<(ClientId, String)>>,
    delivered: Mutex<Vec<(ClientId, String)>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `issue_token` return `None`.
    pub fn refusing_tokens(self) -> Self {
        self.refuse_tokens.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_deliveries(&self, fail: bool) {
        self.fail_deliveries.store(fail, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<(ClientId, String)> {
        self.issued.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<(ClientId, String)> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<(ClientId, String)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Payloads delivered to one client, in order.
    pub fn delivered_to(&self, client_id: &ClientId) -> Vec<String> {
        self.delivered()
            .into_iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl ChannelService for RecordingChannel {
    async fn issue_token(&self, client_id: &ClientId) -> Option<String> {
        if self.refuse_tokens.load(Ordering::SeqCst) {
            return None;
        }
        let token = format!("tok-{}", self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        self.issued
            .lock()
            .unwrap()
            .push((client_id.clone(), token.clone()));
        Some(token)
    }

    async fn revoke_token(&self, client_id: &ClientId, token: &str) {
        self.revoked
            .lock()
            .unwrap()
            .push((client_id.clone(), token.to_string()));
    }

    async fn deliver(&self, client_id: &ClientId, payload: String) -> ChapiResult<()> {
        if self.fail_deliveries.load(Ordering::SeqCst) {
            return Err(ChapiError::Delivery {
                client_id: client_id.to_string(),
                reason: "mock failure".into(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((client_id.clone(), payload));
        Ok(())
    }

    fn parse_presence(&self, kind: PresenceKind, body: &[u8]) -> Option<PresenceEvent> {
        parse_presence_form(kind, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issues_sequential_tokens() {
        let channel = RecordingChannel::new();
        let id = ClientId::new("a");
        assert_eq!(channel.issue_token(&id).await.unwrap(), "tok-1");
        assert_eq!(channel.issue_token(&id).await.unwrap(), "tok-2");
        assert_eq!(channel.issued().len(), 2);

        channel.revoke_token(&id, "tok-1").await;
        assert_eq!(channel.revoked(), vec![(id, "tok-1".to_string())]);
    }

    #[tokio::test]
    async fn refusing_and_failing_modes() {
        let channel = RecordingChannel::new().refusing_tokens();
        assert!(channel.issue_token(&ClientId::new("a")).await.is_none());

        channel.set_fail_deliveries(true);
        assert!(channel.deliver(&ClientId::new("a"), "x".into()).await.is_err());
        assert!(channel.delivered().is_empty());
    }
}
