//! Response charsets understood by the output interceptor.
//!
//! Written bytes are decoded with the held connection's declared charset
//! before they are reframed as text.

use crate::error::{ChapiError, ChapiResult};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl Charset {
    /// Canonical label, as used in `Content-Type`.
    pub fn label(self) -> &'static str {
        match self {
            Charset::Utf8 => "utf-8",
            Charset::Latin1 => "iso-8859-1",
            Charset::Ascii => "us-ascii",
        }
    }

    /// Decode bytes, failing on any sequence invalid under this charset.
    pub fn decode(self, bytes: &[u8]) -> ChapiResult<String> {
        match self {
            Charset::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| self.error(e.to_string())),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Charset::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(self.error(format!(
                    "byte 0x{:02x} at offset {pos} is outside ASCII",
                    bytes[pos]
                ))),
                None => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            },
        }
    }

    /// Encode text, failing on characters this charset cannot represent.
    pub fn encode(self, text: &str) -> ChapiResult<Vec<u8>> {
        let limit = match self {
            Charset::Utf8 => return Ok(text.as_bytes().to_vec()),
            Charset::Latin1 => 0xff,
            Charset::Ascii => 0x7f,
        };
        text.chars()
            .map(|c| {
                u8::try_from(u32::from(c))
                    .ok()
                    .filter(|&b| u32::from(b) <= limit)
                    .ok_or_else(|| self.error(format!("cannot represent {c:?}")))
            })
            .collect()
    }

    fn error(self, reason: String) -> ChapiError {
        ChapiError::Encoding {
            charset: self.label(),
            reason,
        }
    }
}

impl FromStr for Charset {
    type Err = ChapiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            other => Err(ChapiError::Config(format!("unsupported charset: {other}"))),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
