//! chapi-core: shared protocol library for the channel bridge.
//!
//! Provides the channel frame codec, presence classification, response
//! charsets, client identities, signed channel tokens and the error type.

pub mod charset;
pub mod client_id;
pub mod codec;
pub mod error;
pub mod presence;
pub mod token;

// Re-export commonly used items at crate root.
pub use charset::Charset;
pub use client_id::ClientId;
pub use codec::{encode_connected, encode_disconnect, encode_message, Frame, FrameDecoder};
pub use error::{ChapiError, ChapiResult};
pub use presence::{classify, parse_presence_form, PresenceEvent, PresenceKind};
pub use token::{create_token, generate_secret, verify_token};
