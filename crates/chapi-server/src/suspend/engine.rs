//! Parks held responses and arms their timeout timers.

use super::policy::{Action, SuspendPolicy};
use super::{ResumeCause, ResumeHook};
use crate::config::ServerConfig;
use crate::lifecycle::HeldConnection;
use axum::body::Bytes;
use chapi_core::{Charset, ClientId};
use futures_util::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Chunks the held response can buffer before direct writes fail.
const BODY_CAPACITY: usize = 64;

pub struct SuspendEngine {
    policy: SuspendPolicy,
    timeout: Option<Duration>,
    charset: Charset,
    next_episode: AtomicU64,
}

impl SuspendEngine {
    pub fn new(policy: SuspendPolicy, timeout: Option<Duration>, charset: Charset) -> Self {
        Self {
            policy,
            timeout,
            charset,
            next_episode: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            SuspendPolicy::new(config.suspend_paths.clone()),
            config.suspend_timeout,
            config.charset,
        )
    }

    /// Suspend-or-resume decision for an application request.
    pub fn decide(&self, method: &str, path: &str) -> Action {
        self.policy.decide(method, path)
    }

    /// Charset declared on held responses.
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Park a new connection for `client_id`.
    ///
    /// Returns the connection to register and the body stream to hand to the
    /// HTTP layer. The timeout timer (if any) is armed here and cancelled
    /// when the connection's response handle is dropped.
    pub fn suspend(
        &self,
        client_id: ClientId,
        hook: Arc<dyn ResumeHook>,
    ) -> (HeldConnection, HeldBody) {
        let episode = self.next_episode.fetch_add(1, Ordering::Relaxed);
        let (body_tx, body_rx) = mpsc::channel(BODY_CAPACITY);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        if let Some(timeout) = self.timeout {
            let hook = hook.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        debug!(client_id = %client_id.short(), episode, "suspend timeout");
                        hook.on_resume(client_id, episode, ResumeCause::Timeout).await;
                    }
                    _ = cancel_rx => {}
                }
            });
        }

        let response = ResponseHandle {
            episode,
            body_tx,
            _cancel_timer: cancel_tx,
        };
        let body = HeldBody {
            rx: body_rx,
            client_id: client_id.clone(),
            episode,
            hook: Some(hook),
            ended: false,
        };

        (HeldConnection::new(client_id, response, self.charset), body)
    }
}

/// Server side of a held response. Dropping it completes the response and
/// cancels the timeout timer.
#[derive(Debug)]
pub struct ResponseHandle {
    episode: u64,
    body_tx: mpsc::Sender<Bytes>,
    _cancel_timer: oneshot::Sender<()>,
}

impl ResponseHandle {
    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Whether the HTTP client has gone away.
    pub fn is_closed(&self) -> bool {
        self.body_tx.is_closed()
    }

    /// Sender feeding the response body.
    pub fn body_sender(&self) -> mpsc::Sender<Bytes> {
        self.body_tx.clone()
    }
}

/// Response body of a held request.
///
/// Dropped before reaching its end means the client aborted; the resume hook
/// is told so from a spawned task.
pub struct HeldBody {
    rx: mpsc::Receiver<Bytes>,
    client_id: ClientId,
    episode: u64,
    hook: Option<Arc<dyn ResumeHook>>,
    ended: bool,
}

impl HeldBody {
    #[cfg(test)]
    pub fn episode(&self) -> u64 {
        self.episode
    }
}

impl Stream for HeldBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for HeldBody {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        let Some(hook) = self.hook.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let client_id = self.client_id.clone();
            let episode = self.episode;
            runtime.spawn(async move {
                hook.on_resume(client_id, episode, ResumeCause::ClientAbort).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(ClientId, u64, ResumeCause)>>,
    }

    #[async_trait]
    impl ResumeHook for RecordingHook {
        async fn on_resume(&self, client_id: ClientId, episode: u64, cause: ResumeCause) {
            self.calls.lock().unwrap().push((client_id, episode, cause));
        }
    }

    fn engine(timeout: Option<Duration>) -> SuspendEngine {
        SuspendEngine::new(SuspendPolicy::new(vec!["/".into()]), timeout, Charset::Utf8)
    }

    #[tokio::test]
    async fn episodes_increase() {
        let engine = engine(None);
        let hook = Arc::new(RecordingHook::default());
        let (a, _body_a) = engine.suspend(ClientId::new("a"), hook.clone());
        let (b, _body_b) = engine.suspend(ClientId::new("a"), hook.clone());
        assert!(b.episode() > a.episode());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_resume() {
        let engine = engine(Some(Duration::from_secs(30)));
        let hook = Arc::new(RecordingHook::default());
        let (conn, _body) = engine.suspend(ClientId::new("a"), hook.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(ClientId::new("a"), conn.episode(), ResumeCause::Timeout)]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_response_cancels_timer() {
        let engine = engine(Some(Duration::from_secs(30)));
        let hook = Arc::new(RecordingHook::default());
        let (conn, mut body) = engine.suspend(ClientId::new("a"), hook.clone());
        drop(conn);

        assert!(body.next().await.is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(body);
        tokio::task::yield_now().await;

        assert!(hook.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_body_reports_client_abort() {
        let engine = engine(None);
        let hook = Arc::new(RecordingHook::default());
        let (conn, body) = engine.suspend(ClientId::new("a"), hook.clone());
        drop(body);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(conn.response_closed());
        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(ClientId::new("a"), conn.episode(), ResumeCause::ClientAbort)]);
    }
}
