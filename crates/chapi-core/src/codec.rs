//! Text framing for the channel stream.
//!
//! Wire format, one frame after another with no separators:
//!
//! ```text
//! connected:id=<client id>;
//! message:l=<character count>;<payload>
//! disconnect;
//! ```
//!
//! The message length counts UTF-16 code units, the way the browser channel
//! client measures strings. Characters outside the BMP count as two. A client
//! that counts differently loses sync on the first such payload.

use crate::error::{ChapiError, ChapiResult};

const CONNECTED_TAG: &str = "connected:id=";
const MESSAGE_TAG: &str = "message:l=";
const DISCONNECT_FRAME: &str = "disconnect;";

/// Frame announcing that the channel for `client_id` is attached.
pub fn encode_connected(client_id: &str) -> String {
    format!("{CONNECTED_TAG}{client_id};")
}

/// Frame carrying one pushed payload.
pub fn encode_message(payload: &str) -> String {
    format!("{MESSAGE_TAG}{};{payload}", char_len(payload))
}

/// Frame telling the client library to drop its side of the connection.
pub fn encode_disconnect() -> String {
    DISCONNECT_FRAME.to_string()
}

/// Length as declared in a message frame, in UTF-16 code units.
pub fn char_len(payload: &str) -> usize {
    payload.encode_utf16().count()
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connected(String),
    Message(String),
    Disconnect,
}

impl Frame {
    /// Re-encode this frame for the wire.
    pub fn encode(&self) -> String {
        match self {
            Frame::Connected(id) => encode_connected(id),
            Frame::Message(payload) => encode_message(payload),
            Frame::Disconnect => encode_disconnect(),
        }
    }
}

/// Streaming frame decoder for the client side of the channel.
///
/// Accepts arbitrary chunks; a frame (or a UTF-8 sequence inside a payload)
/// may be split across any number of `feed` calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every frame completed by them.
    pub fn feed(&mut self, data: &[u8]) -> ChapiResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while !self.buffer.is_empty() {
            match self.next_frame()? {
                Some((frame, consumed)) => {
                    frames.push(frame);
                    self.buffer.drain(..consumed);
                }
                None => break,
            }
        }

        Ok(frames)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&self) -> ChapiResult<Option<(Frame, usize)>> {
        let buf = &self.buffer[..];

        if buf.starts_with(DISCONNECT_FRAME.as_bytes()) {
            return Ok(Some((Frame::Disconnect, DISCONNECT_FRAME.len())));
        }

        if let Some(rest) = buf.strip_prefix(CONNECTED_TAG.as_bytes()) {
            let Some(end) = rest.iter().position(|&b| b == b';') else {
                return Ok(None);
            };
            let id = std::str::from_utf8(&rest[..end])
                .map_err(|e| ChapiError::Codec(format!("client id is not utf-8: {e}")))?;
            return Ok(Some((
                Frame::Connected(id.to_string()),
                CONNECTED_TAG.len() + end + 1,
            )));
        }

        if let Some(rest) = buf.strip_prefix(MESSAGE_TAG.as_bytes()) {
            return decode_message(rest);
        }

        let partial_tag = [CONNECTED_TAG, MESSAGE_TAG, DISCONNECT_FRAME]
            .iter()
            .any(|tag| tag.as_bytes().starts_with(buf));
        if partial_tag {
            return Ok(None);
        }

        let preview = String::from_utf8_lossy(&buf[..buf.len().min(16)]).into_owned();
        Err(ChapiError::Codec(format!("unknown frame starting with {preview:?}")))
    }
}

/// Decode the part of a message frame following `message:l=`.
fn decode_message(rest: &[u8]) -> ChapiResult<Option<(Frame, usize)>> {
    let Some(semi) = rest.iter().position(|&b| b == b';') else {
        if !rest.iter().all(u8::is_ascii_digit) {
            return Err(ChapiError::Codec("malformed message length".into()));
        }
        return Ok(None);
    };

    let len: usize = std::str::from_utf8(&rest[..semi])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| ChapiError::Codec("malformed message length".into()))?;

    let body = &rest[semi + 1..];
    let text = match std::str::from_utf8(body) {
        Ok(text) => text,
        Err(e) => {
            let valid = &body[..e.valid_up_to()];
            // Safe to re-slice: `valid_up_to` marks a char boundary.
            let text = std::str::from_utf8(valid).map_err(|e| ChapiError::Codec(e.to_string()))?;
            if e.error_len().is_some() && char_len(text) < len {
                return Err(ChapiError::Codec("message payload is not utf-8".into()));
            }
            text
        }
    };

    match payload_end(text, len)? {
        Some(end) => Ok(Some((
            Frame::Message(text[..end].to_string()),
            MESSAGE_TAG.len() + semi + 1 + end,
        ))),
        None => Ok(None),
    }
}

/// Byte offset in `text` where a payload of `len` UTF-16 units ends, or
/// `None` if `text` is still too short.
fn payload_end(text: &str, len: usize) -> ChapiResult<Option<usize>> {
    let mut units = 0;
    for (idx, ch) in text.char_indices() {
        if units == len {
            return Ok(Some(idx));
        }
        units += ch.len_utf16();
        if units > len {
            return Err(ChapiError::Codec("message length splits a surrogate pair".into()));
        }
    }
    Ok((units == len).then_some(text.len()))
}
