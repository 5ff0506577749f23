use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content identifier for an outbound message: the SHA-256 digest of its
/// subject and body, rendered as lowercase hex.
///
/// Each field is framed with its byte length before hashing, so the pair
/// `("A", "BC")` can never collide with `("AB", "C")` — no separator
/// character that a field could smuggle in is involved. The digest being
/// cryptographic matters here: a forged body must not be able to masquerade
/// as a duplicate of a legitimate message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn of(subject: &str, body: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((subject.len() as u64).to_be_bytes());
        hasher.update(subject.as_bytes());
        hasher.update((body.len() as u64).to_be_bytes());
        hasher.update(body.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Rehydrate an identifier already persisted by a store.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
