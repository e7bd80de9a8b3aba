//! Envelope codec.
//!
//! Every PicoNet payload is an ordered list of UTF-8 strings. The list is
//! prefixed with a 2-byte big-endian element count and every element with a
//! 4-byte big-endian byte length, so payload text never needs escaping.
//!
//! Two shapes exist on the wire:
//!
//! - handshake: `[app_id, "HANDSHAKE"]`
//! - event: `[app_id, event_name, payload]`

use crate::error::{DecodeError, WireError};

/// Marker occupying the second slot of a discovery handshake.
pub const HANDSHAKE_MARKER: &str = "HANDSHAKE";

/// Size of the element-count header.
const COUNT_LEN: usize = 2;

/// Size of each element's length prefix.
const ELEMENT_LEN: usize = 4;

/// A decoded PicoNet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Discovery handshake proving the sender shares our application id.
    Handshake {
        /// Application namespace of the sender.
        app_id: String,
    },
    /// A routed, named event.
    Event {
        /// Application namespace of the sender.
        app_id: String,
        /// Event name subscribers register against.
        name: String,
        /// Opaque payload text (may be empty).
        payload: String,
    },
}

impl Envelope {
    /// The application id carried by this envelope.
    pub fn app_id(&self) -> &str {
        match self {
            Envelope::Handshake { app_id } | Envelope::Event { app_id, .. } => app_id,
        }
    }

    /// Discard the envelope unless it belongs to `expected`.
    pub fn verify_identity(self, expected: &str) -> Result<Self, WireError> {
        if self.app_id() == expected {
            Ok(self)
        } else {
            Err(WireError::IdentityMismatch {
                expected: expected.to_string(),
                actual: self.app_id().to_string(),
            })
        }
    }

    /// Encode this envelope to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::Handshake { app_id } => encode_handshake(app_id),
            Envelope::Event {
                app_id,
                name,
                payload,
            } => encode_event(app_id, name, payload),
        }
    }
}

/// Encode a discovery handshake for `app_id`.
pub fn encode_handshake(app_id: &str) -> Vec<u8> {
    encode_elements(&[app_id, HANDSHAKE_MARKER])
}

/// Encode a routed event.
pub fn encode_event(app_id: &str, name: &str, payload: &str) -> Vec<u8> {
    encode_elements(&[app_id, name, payload])
}

fn encode_elements(elements: &[&str]) -> Vec<u8> {
    let body: usize = elements.iter().map(|e| ELEMENT_LEN + e.len()).sum();
    let mut bytes = Vec::with_capacity(COUNT_LEN + body);
    bytes.extend_from_slice(&(elements.len() as u16).to_be_bytes());
    for element in elements {
        bytes.extend_from_slice(&(element.len() as u32).to_be_bytes());
        bytes.extend_from_slice(element.as_bytes());
    }
    bytes
}

/// Decode a payload into an [`Envelope`].
///
/// Anything that is not exactly one of the two known shapes is rejected.
/// The application id is not checked here; see [`Envelope::verify_identity`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut elements = decode_elements(bytes)?;
    match elements.len() {
        2 => {
            let marker = elements.pop().unwrap_or_default();
            if marker != HANDSHAKE_MARKER {
                return Err(DecodeError::UnknownMarker(marker));
            }
            let app_id = elements.pop().unwrap_or_default();
            Ok(Envelope::Handshake { app_id })
        }
        3 => {
            let payload = elements.pop().unwrap_or_default();
            let name = elements.pop().unwrap_or_default();
            let app_id = elements.pop().unwrap_or_default();
            Ok(Envelope::Event {
                app_id,
                name,
                payload,
            })
        }
        n => Err(DecodeError::Arity(n)),
    }
}

fn decode_elements(bytes: &[u8]) -> Result<Vec<String>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut reader = ElementReader { bytes, pos: 0 };
    let count = u16::from_be_bytes(reader.take_array::<COUNT_LEN>()?) as usize;
    // Only 2- and 3-element lists are meaningful; refuse before allocating.
    if !(2..=3).contains(&count) {
        return Err(DecodeError::Arity(count));
    }

    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        let len = u32::from_be_bytes(reader.take_array::<ELEMENT_LEN>()?) as usize;
        let raw = reader.take(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        elements.push(text.to_string());
    }

    let trailing = bytes.len() - reader.pos;
    if trailing > 0 {
        return Err(DecodeError::TrailingBytes(trailing));
    }
    Ok(elements)
}

struct ElementReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ElementReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.bytes.len() - self.pos;
        if len > remaining {
            return Err(DecodeError::Truncated {
                needed: len,
                remaining,
            });
        }
        let bytes: &'a [u8] = self.bytes;
        let slice = &bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
