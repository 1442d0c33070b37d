//! Identity and discovery primitives for keel.
//!
//! This crate holds the types every other keel crate builds on: signing
//! keypairs, the 32-byte [`Topic`] discovery identifier, and deterministic
//! key derivation from a stored primary secret.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod key;
pub mod topic;

pub use key::{
    derive_keypair, DeriveError, EntropyUnavailable, KeyParsingError, PublicKey, SecretKey, Signature,
    SignatureError,
};
pub use topic::Topic;
