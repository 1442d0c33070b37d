//! Cryptographic key handling for keel.
//!
//! A node and a log are both identified by an ed25519 public key. The
//! private half never leaves the process that generated it; everything
//! that crosses the wire carries only public keys and signatures.

use std::{
    cmp::{Ord, PartialOrd},
    fmt::{self, Debug, Display},
    hash::Hash,
    str::FromStr,
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{de, ser, Deserialize, Serialize};

/// A public verification key.
///
/// Displayed and parsed as 64 lowercase hex characters, the encoding used
/// for out-of-band sharing between operators.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// The length of a `PublicKey`, in bytes.
    pub const LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

    /// Get this public key as a byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Construct a `PublicKey` from a byte array.
    ///
    /// Fails if the bytes do not encode a valid curve point. Never fails
    /// for bytes returned from [`Self::as_bytes`].
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        let key = VerifyingKey::from_bytes(bytes)?;
        Ok(Self(key))
    }

    /// Verify a signature on a message made by the matching secret key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0
            .verify_strict(message, &signature.0)
            .map_err(|_| SignatureError)
    }

    /// The first four bytes as hex, for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.as_bytes().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(de::Error::custom)
        } else {
            let data: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Self::from_bytes(&data).map_err(de::Error::custom)
        }
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyParsingError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyParsingError::InvalidLength)?;
        Self::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

/// Parses a `PublicKey` from its lowercase hex encoding.
impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex32(s)?;
        Self::from_bytes(&bytes)
    }
}

/// A secret signing key.
#[derive(Clone, zeroize::ZeroizeOnDrop)]
pub struct SecretKey(SigningKey);

impl Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl SecretKey {
    /// The public key matching this secret key.
    ///
    /// The public half is a pure function of the secret half; two calls
    /// always return the same key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Generate a new key from the platform's secure random source.
    ///
    /// Fails with [`EntropyUnavailable`] if the platform cannot supply secure
    /// randomness.
    pub fn generate() -> Result<Self, EntropyUnavailable> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|_| EntropyUnavailable)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Generate a new key from a caller-supplied randomness generator.
    pub fn generate_with_rng<R: CryptoRngCore + ?Sized>(csprng: &mut R) -> Self {
        Self(SigningKey::generate(csprng))
    }

    /// Sign the given message.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.0.sign(msg))
    }

    /// The bytes of the secret half. The public half can always be
    /// recovered from them.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Create a secret key from its byte representation.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }
}

impl From<[u8; 32]> for SecretKey {
    fn from(value: [u8; 32]) -> Self {
        Self::from_bytes(&value)
    }
}

impl FromStr for SecretKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&decode_hex32(s)?))
    }
}

/// An ed25519 signature.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// The length of a `Signature`, in bytes.
    pub const LENGTH: usize = ed25519_dalek::Signature::BYTE_SIZE;

    /// Return the inner byte array.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    /// Parse a signature from a byte array.
    pub fn from_bytes(bytes: &[u8; Self::LENGTH]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Serialize for Signature {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use ser::SerializeTuple;

        let mut seq = serializer.serialize_tuple(Signature::LENGTH)?;
        for byte in self.to_bytes() {
            seq.serialize_element(&byte)?;
        }
        seq.end()
    }
}

// serde lacks support for deserializing arrays larger than 32 bytes,
// see <https://github.com/serde-rs/serde/issues/631>
impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteArrayVisitor;

        impl<'de> de::Visitor<'de> for ByteArrayVisitor {
            type Value = [u8; Signature::LENGTH];

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("bytestring of length 64")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<[u8; Signature::LENGTH], A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                use de::Error;
                let mut arr = [0u8; Signature::LENGTH];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| Error::invalid_length(i, &self))?;
                }
                Ok(arr)
            }
        }

        deserializer
            .deserialize_tuple(Signature::LENGTH, ByteArrayVisitor)
            .map(|b| Signature::from_bytes(&b))
    }
}

/// Error when parsing a [`PublicKey`] or [`SecretKey`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum KeyParsingError {
    #[error("invalid hex encoding")]
    Hex(#[from] hex::FromHexError),
    #[error(transparent)]
    Key(#[from] ed25519_dalek::SignatureError),
    #[error("invalid length")]
    InvalidLength,
}

/// Verification of a signature failed.
#[derive(Debug, thiserror::Error)]
#[error("invalid signature")]
pub struct SignatureError;

/// The platform could not supply secure randomness.
#[derive(Debug, thiserror::Error)]
#[error("secure randomness unavailable")]
pub struct EntropyUnavailable;

/// Error from [`derive_keypair`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum DeriveError {
    #[error("primary key must be {expected} bytes, got {got}")]
    InvalidPrimaryKey { expected: usize, got: usize },
}

/// Domain separation context for [`derive_keypair`]. The context string is
/// part of the algorithm, not a secret.
const KEYPAIR_DERIVE_CONTEXT: &str = "keel v1 keypair derivation";

/// Deterministically derive a keypair from a 32-byte primary secret and a
/// label.
///
/// Identical `(primary_key, name)` inputs always yield the identical
/// keypair, which lets an application reproduce a whole set of log keys
/// from one stored secret. Different names yield cryptographically
/// independent keys.
pub fn derive_keypair(primary_key: &[u8], name: &[u8]) -> Result<SecretKey, DeriveError> {
    if primary_key.len() != 32 {
        return Err(DeriveError::InvalidPrimaryKey {
            expected: 32,
            got: primary_key.len(),
        });
    }
    // The primary key is fixed-length, so the concatenation is unambiguous.
    let mut material = Vec::with_capacity(32 + name.len());
    material.extend_from_slice(primary_key);
    material.extend_from_slice(name);
    let seed = blake3::derive_key(KEYPAIR_DERIVE_CONTEXT, &material);
    Ok(SecretKey::from_bytes(&seed))
}

fn decode_hex32(s: &str) -> Result<[u8; 32], KeyParsingError> {
    let v = hex::decode(s)?;
    let bytes: [u8; 32] = v
        .try_into()
        .map_err(|_| KeyParsingError::InvalidLength)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_display_and_parse_roundtrip() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        for _ in 0..20 {
            let key = SecretKey::generate_with_rng(&mut rng).public();
            let s = key.to_string();
            assert_eq!(s.len(), 64);
            assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            let parsed = PublicKey::from_str(&s).unwrap();
            assert_eq!(key, parsed, "roundtrip failed for {}", s);
        }
    }

    #[test]
    fn test_public_is_function_of_secret() {
        let secret = SecretKey::from_bytes(&[7u8; 32]);
        assert_eq!(secret.public(), secret.clone().public());
        assert_eq!(
            SecretKey::from_bytes(&secret.to_bytes()).public(),
            secret.public()
        );
    }

    #[test]
    fn test_sign_verify() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(2);
        let secret = SecretKey::generate_with_rng(&mut rng);
        let sig = secret.sign(b"hello world");
        secret.public().verify(b"hello world", &sig).unwrap();
        assert!(secret.public().verify(b"hello there", &sig).is_err());
    }

    #[test]
    fn test_signature_postcard() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let secret = SecretKey::generate_with_rng(&mut rng);
        let sig = secret.sign(b"payload");
        let bytes = postcard::to_stdvec(&sig).unwrap();
        assert_eq!(bytes.len(), Signature::LENGTH);
        let sig2: Signature = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(sig, sig2);
    }

    #[test]
    fn test_public_key_postcard() {
        let key = SecretKey::from_bytes(&[1u8; 32]).public();
        let bytes = postcard::to_stdvec(&key).unwrap();
        assert_eq!(bytes.len(), PublicKey::LENGTH);
        let key2: PublicKey = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(key, key2);
    }

    #[test]
    fn test_public_key_json_is_hex() {
        let key = SecretKey::from_bytes(&[1u8; 32]).public();
        let s = serde_json::to_string(&key).unwrap();
        assert_eq!(s, format!("\"{key}\""));
        let key2: PublicKey = serde_json::from_str(&s).unwrap();
        assert_eq!(key, key2);
    }

    #[test]
    fn test_derive_keypair_deterministic() {
        let primary = [42u8; 32];
        let a = derive_keypair(&primary, b"logs/main").unwrap();
        let b = derive_keypair(&primary, b"logs/main").unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn test_derive_keypair_name_separation() {
        let primary = [42u8; 32];
        let a = derive_keypair(&primary, b"logs/main").unwrap();
        let b = derive_keypair(&primary, b"logs/other").unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_derive_keypair_rejects_short_primary() {
        let err = derive_keypair(&[0u8; 16], b"name").unwrap_err();
        assert!(matches!(
            err,
            DeriveError::InvalidPrimaryKey { expected: 32, got: 16 }
        ));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(PublicKey::from_str("not hex at all").is_err());
        assert!(PublicKey::from_str("abcd").is_err());
    }
}
