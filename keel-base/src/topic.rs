//! The 32-byte discovery identifier.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use serde::{de, Deserialize, Serialize};

use crate::key::{KeyParsingError, PublicKey};

/// Domain separation contexts. Deriving a topic from a name and from a
/// public key must never collide, even for identical input bytes.
const TOPIC_FROM_NAME_CONTEXT: &str = "keel v1 topic from name";
const TOPIC_FROM_KEY_CONTEXT: &str = "keel v1 discovery key";

/// A 32-byte opaque identifier used for peer discovery.
///
/// Topics are derived by one-way hashing: either of an application-chosen
/// name, or of a log's public key (its *discovery key*). Two nodes obtain
/// the same topic exactly when they hash byte-identical input; the topic
/// reveals nothing about the input it was derived from, so a discovery key
/// is safe to hand to infrastructure that must not read the log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic([u8; 32]);

impl Topic {
    /// The length of a `Topic`, in bytes.
    pub const LENGTH: usize = 32;

    /// Derive a topic from an application-chosen name.
    pub fn from_name(name: impl AsRef<[u8]>) -> Self {
        Self(blake3::derive_key(TOPIC_FROM_NAME_CONTEXT, name.as_ref()))
    }

    /// Derive the discovery key for a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(blake3::derive_key(TOPIC_FROM_KEY_CONTEXT, key.as_bytes()))
    }

    /// Construct a topic from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The topic as a byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The first four bytes as hex, for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; 32]> for Topic {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Topic {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.fmt_short())
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Topic {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = hex::decode(s)?;
        let bytes: [u8; 32] = v.try_into().map_err(|_| KeyParsingError::InvalidLength)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use crate::key::SecretKey;

    use super::*;

    #[test]
    fn test_from_name_deterministic() {
        let a = Topic::from_name("swarm/example");
        let b = Topic::from_name("swarm/example");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), Topic::LENGTH);
    }

    #[test]
    fn test_distinct_names_distinct_topics() {
        assert_ne!(Topic::from_name("a"), Topic::from_name("b"));
        // A single trailing byte matters: discovery silently fails unless
        // both sides hash byte-identical input.
        assert_ne!(Topic::from_name("chat"), Topic::from_name("chat\n"));
    }

    #[test]
    fn test_name_and_key_domains_are_separated() {
        let key = SecretKey::from_bytes(&[9u8; 32]).public();
        let from_key = Topic::from_public_key(&key);
        let from_name = Topic::from_name(key.as_bytes());
        assert_ne!(from_key, from_name);
    }

    #[test]
    fn test_discovery_key_hides_public_key() {
        let key = SecretKey::from_bytes(&[9u8; 32]).public();
        let topic = Topic::from_public_key(&key);
        assert_ne!(topic.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let topic = Topic::from_name("roundtrip");
        let parsed: Topic = topic.to_string().parse().unwrap();
        assert_eq!(topic, parsed);
    }
}
