//! Held connections and the registry mapping each client to its current one.
//!
//! Lock order is always registry map, then connection. Nothing is delivered
//! while either lock is held.

use crate::interceptor::{ConnectionSink, DirectSink, PendingDelivery};
use crate::suspend::{ResponseHandle, ResumeCause};
use chapi_core::{ChapiError, ChapiResult, Charset, ClientId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Lifecycle state of one held connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Held open, channel not attached yet.
    Suspended,
    /// Channel attached; writes are intercepted.
    Connected,
    /// Resumed. Terminal.
    Finished,
}

/// One suspended request.
#[derive(Debug)]
pub struct HeldConnection {
    client_id: ClientId,
    episode: u64,
    state: ConnectionState,
    sink: ConnectionSink,
    /// The held response; `None` once released.
    response: Option<ResponseHandle>,
    /// Channel token issued for this episode, held until it is revoked.
    token: Option<String>,
    charset: Charset,
    created_at: Instant,
}

impl HeldConnection {
    pub fn new(client_id: ClientId, response: ResponseHandle, charset: Charset) -> Self {
        Self {
            episode: response.episode(),
            sink: ConnectionSink::Direct(DirectSink::new(response.body_sender())),
            client_id,
            state: ConnectionState::Suspended,
            response: Some(response),
            token: None,
            charset,
            created_at: Instant::now(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn sink_kind(&self) -> &'static str {
        self.sink.kind()
    }

    /// Whether the held response is still present and its client still there.
    pub fn is_live(&self) -> bool {
        !self.response_closed()
    }

    pub fn response_closed(&self) -> bool {
        self.response.as_ref().map_or(true, ResponseHandle::is_closed)
    }

    /// Remember the channel token of this episode. Returns false when the
    /// connection has already finished; the caller then owns the token.
    pub fn set_token(&mut self, token: String) -> bool {
        if self.state == ConnectionState::Finished {
            return false;
        }
        self.token = Some(token);
        true
    }

    pub fn take_token(&mut self) -> Option<String> {
        self.token.take()
    }

    /// `Suspended → Connected`: route writes through the output interceptor.
    ///
    /// Returns the `connected:id=` frame announcing the channel. A repeated
    /// attach re-announces without changing anything. A finished connection
    /// cannot be attached.
    pub fn attach(&mut self) -> ChapiResult<PendingDelivery> {
        match self.state {
            ConnectionState::Suspended => {
                if let Err(e) = self.sink.attach(&self.client_id, self.charset) {
                    debug!(client_id = %self.client_id.short(), error = %e, "direct bytes lost on attach");
                }
                self.state = ConnectionState::Connected;
            }
            ConnectionState::Connected => {}
            ConnectionState::Finished => {
                return Err(ChapiError::ConnectionNotFound(self.client_id.to_string()))
            }
        }
        Ok(PendingDelivery::connected(&self.client_id))
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.sink.write(bytes);
    }

    pub fn flush(&mut self) -> ChapiResult<Option<PendingDelivery>> {
        self.sink.flush()
    }

    /// Write text encoded with the connection's charset, then flush.
    pub fn write_text(&mut self, text: &str) -> ChapiResult<Option<PendingDelivery>> {
        if self.state == ConnectionState::Finished {
            return Ok(None);
        }
        let bytes = self.charset.encode(text)?;
        self.write(&bytes);
        self.flush()
    }

    /// Terminal transition: detach the sink and release the response.
    ///
    /// Returns the `disconnect;` frame to send when the cause calls for one
    /// and the channel is still attached to a live client. Only the first
    /// call does anything.
    pub fn finish(&mut self, cause: ResumeCause) -> Option<PendingDelivery> {
        if self.state == ConnectionState::Finished {
            return None;
        }
        let attached = self.state == ConnectionState::Connected;
        let farewell = (cause.sends_farewell() && attached && self.is_live())
            .then(|| PendingDelivery::disconnect(&self.client_id));

        self.sink.detach();
        self.response = None;
        self.state = ConnectionState::Finished;
        info!(
            client_id = %self.client_id.short(),
            episode = self.episode,
            cause = ?cause,
            "connection resumed"
        );
        farewell
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.client_id.clone(),
            episode: self.episode,
            state: self.state,
            sink: self.sink_kind(),
            live: self.is_live(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Snapshot of a registered connection, as listed by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub client_id: ClientId,
    pub episode: u64,
    pub state: ConnectionState,
    /// `direct`, `intercepted` or `detached`.
    pub sink: &'static str,
    pub live: bool,
    pub age_secs: u64,
}

pub type SharedConnection = Arc<Mutex<HeldConnection>>;

struct Entry {
    episode: u64,
    conn: SharedConnection,
}

/// Result of registering a connection.
pub struct Registered {
    pub conn: SharedConnection,
    /// The connection previously registered for the same client, now unregistered.
    pub replaced: Option<SharedConnection>,
}

/// Maps each client to its one current held connection.
pub struct ConnectionRegistry {
    entries: Arc<RwLock<HashMap<ClientId, Entry>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_connections,
        }
    }

    /// Register `conn` for its client, replacing any previous entry.
    pub async fn register(&self, conn: HeldConnection) -> ChapiResult<Registered> {
        let client_id = conn.client_id().clone();
        let episode = conn.episode();

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_connections && !entries.contains_key(&client_id) {
            return Err(ChapiError::ConnectionLimit(self.max_connections));
        }

        let shared = Arc::new(Mutex::new(conn));
        let replaced = entries
            .insert(
                client_id.clone(),
                Entry {
                    episode,
                    conn: shared.clone(),
                },
            )
            .map(|old| old.conn);
        debug!(client_id = %client_id.short(), episode, replaced = replaced.is_some(), "connection registered");

        Ok(Registered {
            conn: shared,
            replaced,
        })
    }

    pub async fn get(&self, client_id: &ClientId) -> Option<SharedConnection> {
        self.entries
            .read()
            .await
            .get(client_id)
            .map(|entry| entry.conn.clone())
    }

    pub async fn remove(&self, client_id: &ClientId) -> Option<SharedConnection> {
        self.entries
            .write()
            .await
            .remove(client_id)
            .map(|entry| entry.conn)
    }

    /// Remove the entry only if it is still the given episode.
    pub async fn remove_episode(&self, client_id: &ClientId, episode: u64) -> Option<SharedConnection> {
        let mut entries = self.entries.write().await;
        match entries.get(client_id) {
            Some(entry) if entry.episode == episode => entries.remove(client_id).map(|e| e.conn),
            _ => None,
        }
    }

    #[cfg(test)]
    pub async fn contains(&self, client_id: &ClientId) -> bool {
        self.entries.read().await.contains_key(client_id)
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Unregister everything.
    pub async fn drain(&self) -> Vec<SharedConnection> {
        self.entries
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry.conn)
            .collect()
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let entries = self.entries.read().await;
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            infos.push(entry.conn.lock().await.info());
        }
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        infos
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}
