//! Device identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identifier accepted on the wire, in bytes
pub const MAX_DEVICE_ID_LEN: usize = 63;

/// Reserved identifier of the admin console; the only broadcast recipient
pub const ADMIN_CONSOLE_ID: &str = "ADMIN_CONSOLE";

/// Name of a connected device, unique per live notification session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate a locally supplied identifier
    pub fn new(id: impl Into<String>) -> Result<Self, crate::WireError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_DEVICE_ID_LEN {
            return Err(crate::WireError::DeviceId(id));
        }
        Ok(Self(id))
    }

    /// Decode an identifier received as a frame payload.
    ///
    /// The identifier ends at the first NUL. Bytes are decoded lossily,
    /// trailing CR/LF are stripped and the result is cut to
    /// [`MAX_DEVICE_ID_LEN`] bytes on a char boundary. Returns `None` when
    /// nothing is left.
    pub fn from_wire(payload: &[u8]) -> Option<Self> {
        let payload = match payload.iter().position(|&b| b == 0) {
            Some(nul) => &payload[..nul],
            None => payload,
        };
        let text = String::from_utf8_lossy(payload);
        let trimmed = text.trim_end_matches(['\r', '\n']);

        let mut end = trimmed.len().min(MAX_DEVICE_ID_LEN);
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        let id = &trimmed[..end];

        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    /// The admin console identifier
    pub fn admin_console() -> Self {
        Self(ADMIN_CONSOLE_ID.to_string())
    }

    /// Whether this is the admin console
    pub fn is_admin_console(&self) -> bool {
        self.0 == ADMIN_CONSOLE_ID
    }

    /// Identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for DeviceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DeviceId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl TryFrom<String> for DeviceId {
    type Error = crate::WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}
