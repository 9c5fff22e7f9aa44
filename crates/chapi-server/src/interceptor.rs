//! Output sinks of held connections.
//!
//! Before its channel attaches, a held connection writes straight into its
//! HTTP response ([`DirectSink`]). Once attached, writes are captured by an
//! [`OutputInterceptor`] and every flush becomes one `message:l=…;` frame for
//! the channel service. After teardown the sink is detached and drops writes.

use crate::channel::ChannelService;
use axum::body::Bytes;
use chapi_core::{encode_connected, encode_disconnect, encode_message};
use chapi_core::{ChapiError, ChapiResult, Charset, ClientId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// A framed payload waiting to be handed to the channel service.
///
/// Produced under the connection lock, sent after it is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub client_id: ClientId,
    pub payload: String,
}

impl PendingDelivery {
    pub fn connected(client_id: &ClientId) -> Self {
        Self {
            client_id: client_id.clone(),
            payload: encode_connected(client_id.as_str()),
        }
    }

    pub fn disconnect(client_id: &ClientId) -> Self {
        Self {
            client_id: client_id.clone(),
            payload: encode_disconnect(),
        }
    }

    pub async fn send(self, channel: &dyn ChannelService) -> ChapiResult<()> {
        debug!(client_id = %self.client_id.short(), frame_len = self.payload.len(), "delivering frame");
        channel.deliver(&self.client_id, self.payload).await
    }
}

/// Writes into the held HTTP response body.
#[derive(Debug)]
pub struct DirectSink {
    tx: mpsc::Sender<Bytes>,
    buffer: Vec<u8>,
}

impl DirectSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            buffer: Vec::new(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn flush(&mut self) -> ChapiResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buffer));
        self.tx.try_send(chunk).map_err(|e| {
            ChapiError::Other(match e {
                TrySendError::Full(_) => "held response buffer full".into(),
                TrySendError::Closed(_) => "held response closed".into(),
            })
        })
    }
}

/// Captures writes to an attached connection and reframes them for its
/// channel.
#[derive(Debug)]
pub struct OutputInterceptor {
    client_id: ClientId,
    charset: Charset,
    buffer: Vec<u8>,
    /// The real sink; `None` once detached.
    inner: Option<DirectSink>,
}

impl OutputInterceptor {
    pub fn wrap(inner: DirectSink, client_id: ClientId, charset: Charset) -> Self {
        Self {
            client_id,
            charset,
            buffer: Vec::new(),
            inner: Some(inner),
        }
    }

    /// Buffer bytes. Never touches the real sink; dropped after detach.
    pub fn write(&mut self, bytes: &[u8]) {
        if self.inner.is_some() {
            self.buffer.extend_from_slice(bytes);
        }
    }

    /// Turn the buffered bytes into one message frame.
    ///
    /// An empty buffer yields nothing. Bytes that are invalid under the
    /// connection's charset fail the flush and are discarded.
    pub fn flush(&mut self) -> ChapiResult<Option<PendingDelivery>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let bytes = std::mem::take(&mut self.buffer);
        let text = self.charset.decode(&bytes)?;
        Ok(Some(PendingDelivery {
            client_id: self.client_id.clone(),
            payload: encode_message(&text),
        }))
    }

    /// Drop the real sink and any buffered bytes.
    pub fn detach(&mut self) {
        self.inner = None;
        self.buffer.clear();
    }

    #[cfg(test)]
    pub fn is_detached(&self) -> bool {
        self.inner.is_none()
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Where writes to a held connection currently go.
#[derive(Debug)]
pub enum ConnectionSink {
    Direct(DirectSink),
    Intercepted(OutputInterceptor),
    Detached,
}

impl ConnectionSink {
    /// Route future writes through an interceptor. Bytes still buffered for
    /// the response are flushed to it first.
    pub fn attach(&mut self, client_id: &ClientId, charset: Charset) -> ChapiResult<()> {
        match std::mem::replace(self, ConnectionSink::Detached) {
            ConnectionSink::Direct(mut direct) => {
                let flushed = direct.flush();
                *self = ConnectionSink::Intercepted(OutputInterceptor::wrap(
                    direct,
                    client_id.clone(),
                    charset,
                ));
                flushed
            }
            other => {
                *self = other;
                Ok(())
            }
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        match self {
            ConnectionSink::Direct(direct) => direct.write(bytes),
            ConnectionSink::Intercepted(interceptor) => interceptor.write(bytes),
            ConnectionSink::Detached => {}
        }
    }

    /// Flush buffered bytes. Only an intercepted sink produces a delivery.
    pub fn flush(&mut self) -> ChapiResult<Option<PendingDelivery>> {
        match self {
            ConnectionSink::Direct(direct) => direct.flush().map(|()| None),
            ConnectionSink::Intercepted(interceptor) => interceptor.flush(),
            ConnectionSink::Detached => Ok(None),
        }
    }

    pub fn detach(&mut self) {
        if let ConnectionSink::Intercepted(interceptor) = self {
            interceptor.detach();
        }
        *self = ConnectionSink::Detached;
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionSink::Direct(_) => "direct",
            ConnectionSink::Intercepted(_) => "intercepted",
            ConnectionSink::Detached => "detached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::RecordingChannel;

    fn interceptor(charset: Charset) -> (OutputInterceptor, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let sink = OutputInterceptor::wrap(DirectSink::new(tx), ClientId::new("c1"), charset);
        (sink, rx)
    }

    #[tokio::test]
    async fn flush_frames_buffered_bytes() {
        let (mut sink, mut rx) = interceptor(Charset::Utf8);
        sink.write(b"h");
        sink.write(b"i");

        let pending = sink.flush().unwrap().unwrap();
        assert_eq!(pending.payload, "message:l=2;hi");
        assert_eq!(sink.buffered(), 0);
        assert!(rx.try_recv().is_err());

        let channel = RecordingChannel::new();
        pending.send(&channel).await.unwrap();
        assert_eq!(channel.delivered_to(&ClientId::new("c1")), vec!["message:l=2;hi"]);
    }

    #[test]
    fn empty_flush_is_noop() {
        let (mut sink, _rx) = interceptor(Charset::Utf8);
        assert!(sink.flush().unwrap().is_none());
    }

    #[test]
    fn multibyte_split_across_writes() {
        let (mut sink, _rx) = interceptor(Charset::Utf8);
        let bytes = "€5".as_bytes();
        sink.write(&bytes[..2]);
        sink.write(&bytes[2..]);
        assert_eq!(sink.flush().unwrap().unwrap().payload, "message:l=2;€5");
    }

    #[test]
    fn declared_charset_governs_length() {
        let (mut sink, _rx) = interceptor(Charset::Latin1);
        sink.write(&[0x63, 0x61, 0x66, 0xe9]);
        assert_eq!(sink.flush().unwrap().unwrap().payload, "message:l=4;café");
    }

    #[test]
    fn invalid_bytes_fail_and_are_discarded() {
        let (mut sink, _rx) = interceptor(Charset::Utf8);
        sink.write(&[0xff, 0x00]);
        assert!(matches!(sink.flush(), Err(ChapiError::Encoding { .. })));
        assert_eq!(sink.buffered(), 0);

        sink.write(b"ok");
        assert_eq!(sink.flush().unwrap().unwrap().payload, "message:l=2;ok");
    }

    #[test]
    fn writes_after_detach_are_dropped() {
        let (mut sink, _rx) = interceptor(Charset::Utf8);
        sink.write(b"pending");
        sink.detach();
        assert!(sink.is_detached());
        sink.write(b"late");
        assert!(sink.flush().unwrap().is_none());
    }

    #[tokio::test]
    async fn attach_moves_direct_bytes_to_response_first() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut sink = ConnectionSink::Direct(DirectSink::new(tx));
        sink.write(b"before");
        sink.attach(&ClientId::new("c1"), Charset::Utf8).unwrap();
        assert_eq!(sink.kind(), "intercepted");
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"before"));

        sink.write(b"after");
        let pending = sink.flush().unwrap().unwrap();
        assert_eq!(pending.payload, "message:l=5;after");

        sink.detach();
        assert_eq!(sink.kind(), "detached");
        sink.write(b"x");
        assert!(sink.flush().unwrap().is_none());
    }

    #[test]
    fn direct_flush_reports_closed_response() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = ConnectionSink::Direct(DirectSink::new(tx));
        sink.write(b"x");
        assert!(sink.flush().is_err());
    }
}
