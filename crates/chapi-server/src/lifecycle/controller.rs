//! Lifecycle controller: drives each client's held connection through
//! `Suspended → Connected → Finished`.
//!
//! Every resume path (disconnect presence, timeout, client abort, admin
//! resume, replacement, shutdown) goes through [`LifecycleController::resume`]
//! so teardown happens once per episode. Finishing an episode also revokes
//! its channel token.

use super::registry::{ConnectionInfo, ConnectionRegistry, HeldConnection, SharedConnection};
use crate::channel::ChannelService;
use crate::suspend::{ResumeCause, ResumeHook};
use async_trait::async_trait;
use chapi_core::{ChapiError, ChapiResult, ClientId, PresenceKind};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reacts to channel presence notifications.
#[async_trait]
pub trait PresenceHandler: Send + Sync {
    async fn on_connected(&self, client_id: &ClientId) -> ChapiResult<()>;
    async fn on_disconnected(&self, client_id: &ClientId) -> ChapiResult<()>;
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct LifecycleController {
    registry: Arc<ConnectionRegistry>,
    channel: Arc<dyn ChannelService>,
}

impl LifecycleController {
    pub fn new(registry: Arc<ConnectionRegistry>, channel: Arc<dyn ChannelService>) -> Self {
        Self { registry, channel }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// `Unregistered → Suspended`: register a freshly parked connection and
    /// issue its channel token.
    ///
    /// A connection already registered for the same client is resumed. If no
    /// token can be issued the registration is rolled back and the request
    /// fails; that means the channel service is down or misconfigured.
    pub async fn register(&self, conn: HeldConnection) -> ChapiResult<String> {
        let client_id = conn.client_id().clone();
        let episode = conn.episode();
        let registered = self.registry.register(conn).await?;

        if let Some(replaced) = registered.replaced {
            self.finish(replaced, ResumeCause::Replaced).await;
        }

        match self.channel.issue_token(&client_id).await {
            Some(token) if !token.is_empty() => {
                // Resumed while the token was being issued.
                if !registered.conn.lock().await.set_token(token.clone()) {
                    debug!(
                        client_id = %client_id.short(),
                        episode,
                        "connection finished before its token was stored"
                    );
                    self.channel.revoke_token(&client_id, &token).await;
                }
                info!(client_id = %client_id.short(), episode, "connection suspended");
                Ok(token)
            }
            _ => {
                error!(client_id = %client_id.short(), "channel service issued no token");
                if let Some(conn) = self.registry.remove_episode(&client_id, episode).await {
                    self.finish(conn, ResumeCause::Administrative).await;
                }
                Err(ChapiError::TokenIssuance(client_id.to_string()))
            }
        }
    }

    /// Parse and apply a presence notification body.
    ///
    /// A body that carries no presence event is skipped without error.
    pub async fn handle_presence(&self, kind: PresenceKind, body: &[u8]) -> ChapiResult<()> {
        let Some(event) = self.channel.parse_presence(kind, body) else {
            debug!(kind = ?kind, "presence notification without event, skipping");
            return Ok(());
        };
        debug!(client_id = %event.client_id.short(), connected = event.connected, "presence notification");

        if event.connected {
            self.on_connected(&event.client_id).await
        } else {
            self.on_disconnected(&event.client_id).await
        }
    }

    /// Resume the registered connection of `client_id`.
    ///
    /// With `episode` set, only that episode is resumed; a newer connection
    /// for the same client is left alone. Returns whether anything was
    /// resumed.
    pub async fn resume(&self, client_id: &ClientId, episode: Option<u64>, cause: ResumeCause) -> bool {
        let removed = match episode {
            Some(episode) => self.registry.remove_episode(client_id, episode).await,
            None => self.registry.remove(client_id).await,
        };
        match removed {
            Some(conn) => {
                self.finish(conn, cause).await;
                true
            }
            None => {
                debug!(client_id = %client_id.short(), cause = ?cause, "resume for unregistered connection ignored");
                false
            }
        }
    }

    /// Write `text` to the client's held connection and flush it.
    pub async fn write_to(&self, client_id: &ClientId, text: &str) -> ChapiResult<()> {
        let conn = self
            .registry
            .get(client_id)
            .await
            .ok_or_else(|| ChapiError::ConnectionNotFound(client_id.to_string()))?;

        let pending = conn.lock().await.write_text(text)?;
        if let Some(pending) = pending {
            pending.send(self.channel.as_ref()).await?;
        }
        Ok(())
    }

    /// Write `text` to every registered connection.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for client_id in self.registry.client_ids().await {
            match self.write_to(&client_id, text).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(client_id = %client_id.short(), error = %e, "broadcast write failed");
                    report.failed += 1;
                }
            }
        }
        debug!(delivered = report.delivered, failed = report.failed, "broadcast complete");
        report
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list().await
    }

    /// Resume every held connection.
    pub async fn shutdown(&self) {
        let conns = self.registry.drain().await;
        info!(count = conns.len(), "resuming held connections for shutdown");
        for conn in conns {
            self.finish(conn, ResumeCause::Shutdown).await;
        }
    }

    /// Run the terminal transition, then revoke the episode's token and send
    /// the farewell frame if any.
    async fn finish(&self, conn: SharedConnection, cause: ResumeCause) {
        let (client_id, token, farewell) = {
            let mut conn = conn.lock().await;
            (conn.client_id().clone(), conn.take_token(), conn.finish(cause))
        };
        if let Some(token) = token {
            self.channel.revoke_token(&client_id, &token).await;
        }
        if let Some(farewell) = farewell {
            if let Err(e) = farewell.send(self.channel.as_ref()).await {
                warn!(client_id = %client_id.short(), error = %e, "failed to deliver disconnect frame");
            }
        }
    }
}

#[async_trait]
impl PresenceHandler for LifecycleController {
    /// `Suspended → Connected`. No registered connection means the presence
    /// layer and the suspend layer disagree about who is live.
    async fn on_connected(&self, client_id: &ClientId) -> ChapiResult<()> {
        let Some(conn) = self.registry.get(client_id).await else {
            error!(client_id = %client_id, "connected presence for unknown client");
            return Err(ChapiError::ConnectionNotFound(client_id.to_string()));
        };
        let announce = conn.lock().await.attach()?;
        info!(client_id = %client_id.short(), "channel connected");

        // Sent unlocked, so a timeout or broadcast racing this attach may
        // reach the channel before the connected frame does.
        announce.send(self.channel.as_ref()).await
    }

    /// `Connected → Finished`. An unknown client has most likely torn down
    /// already.
    async fn on_disconnected(&self, client_id: &ClientId) -> ChapiResult<()> {
        if !self.resume(client_id, None, ResumeCause::Disconnected).await {
            warn!(client_id = %client_id, "no held connection for disconnecting channel");
        }
        Ok(())
    }
}

#[async_trait]
impl ResumeHook for LifecycleController {
    async fn on_resume(&self, client_id: ClientId, episode: u64, cause: ResumeCause) {
        self.resume(&client_id, Some(episode), cause).await;
    }
}
