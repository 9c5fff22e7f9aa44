//! Request admission: presence notification or held application request.

use crate::lifecycle::LifecycleController;
use crate::suspend::{Action, HeldBody, SuspendEngine};
use axum::body::Bytes;
use chapi_core::presence::presence_form;
use chapi_core::{classify, ChapiResult, Charset, ClientId, PresenceKind};
use std::sync::Arc;
use tracing::debug;

/// The parts of an inbound request the gate looks at.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    /// Identity a reconnecting client asks to keep.
    pub client_id: Option<ClientId>,
    pub body: Bytes,
}

impl InboundRequest {
    /// A presence notification for `client_id`, as the channel service posts it.
    pub fn presence(kind: PresenceKind, client_id: &ClientId) -> Option<Self> {
        Some(Self {
            method: "POST".into(),
            path: kind.path()?.into(),
            client_id: None,
            body: Bytes::from(presence_form(client_id)),
        })
    }
}

/// A request the gate has parked.
pub struct Suspended {
    pub client_id: ClientId,
    pub token: String,
    pub charset: Charset,
    pub body: HeldBody,
}

pub enum Admission {
    /// Complete the request now. `presence` says whether it was a presence
    /// notification.
    Resume { presence: PresenceKind },
    /// Hold the request open; the token goes out with the response headers.
    Suspend(Suspended),
}

pub struct AdmissionGate {
    controller: Arc<LifecycleController>,
    engine: Arc<SuspendEngine>,
}

impl AdmissionGate {
    pub fn new(controller: Arc<LifecycleController>, engine: Arc<SuspendEngine>) -> Self {
        Self { controller, engine }
    }

    pub async fn admit(&self, req: InboundRequest) -> ChapiResult<Admission> {
        let kind = classify(&req.method, &req.path);
        if kind.is_presence() {
            debug!(path = %req.path, kind = ?kind, "presence notification");
            self.controller.handle_presence(kind, &req.body).await?;
            return Ok(Admission::Resume { presence: kind });
        }

        match self.engine.decide(&req.method, &req.path) {
            Action::Resume => {
                debug!(method = %req.method, path = %req.path, "request not suspended");
                Ok(Admission::Resume {
                    presence: PresenceKind::None,
                })
            }
            Action::Suspend => {
                let client_id = match req.client_id {
                    Some(id) => id,
                    None => ClientId::generate()?,
                };
                let (conn, body) = self.engine.suspend(client_id.clone(), self.controller.clone());
                // The token must be known before the response is parked.
                let token = self.controller.register(conn).await?;
                Ok(Admission::Suspend(Suspended {
                    client_id,
                    token,
                    charset: self.engine.charset(),
                    body,
                }))
            }
        }
    }
}
