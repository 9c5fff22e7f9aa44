//! Request suspension: deciding which requests are held open, parking their
//! responses, and reporting every resume back to the lifecycle controller.
//!
//! A held response is an HTTP body stream fed by an `mpsc` channel. The
//! connection stays parked until one of three things happens:
//!
//! - the controller resumes it (disconnect presence, admin resume, shutdown,
//!   replacement by a newer connection for the same client),
//! - the suspend timeout fires,
//! - the client goes away and the body stream is dropped.
//!
//! All three reach [`ResumeHook::on_resume`] with the connection's episode,
//! so a late trigger for an old episode is a no-op.

pub mod engine;
pub mod policy;

pub use engine::{HeldBody, ResponseHandle, SuspendEngine};
pub use policy::Action;

use async_trait::async_trait;
use chapi_core::ClientId;

/// Why a held connection was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCause {
    /// The client's channel detached.
    Disconnected,
    /// The suspend timeout elapsed.
    Timeout,
    /// The HTTP client dropped the held request.
    ClientAbort,
    /// An operator resumed the connection.
    Administrative,
    /// A newer connection registered for the same client.
    Replaced,
    /// The server is shutting down.
    Shutdown,
}

impl ResumeCause {
    /// Whether a live client should be told to drop its side with a
    /// `disconnect;` frame.
    pub fn sends_farewell(self) -> bool {
        matches!(
            self,
            ResumeCause::Timeout | ResumeCause::Administrative | ResumeCause::Shutdown
        )
    }
}

/// Invoked on every resume, whatever caused it.
#[async_trait]
pub trait ResumeHook: Send + Sync {
    async fn on_resume(&self, client_id: ClientId, episode: u64, cause: ResumeCause);
}
