//! Authenticated key exchange for streams.
//!
//! Three messages: the initiator sends its identity, an ephemeral x25519
//! key and an application payload; the responder answers with its own
//! identity and ephemeral key plus a signature over the transcript; the
//! initiator proves its identity with a signature sent inside the first
//! encrypted frame. Both directions then run ChaCha20-Poly1305 with keys
//! derived from the ephemeral shared secret and the transcript, so a
//! connection's identity is the remote public key, proven rather than
//! claimed.

use bytes::Bytes;
use curve25519_dalek::montgomery::MontgomeryPoint;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use keel_base::{PublicKey, SecretKey, Signature};

use crate::{
    frames::{read_frame, read_raw_frame, write_frame, write_raw_frame},
    stream::Cipher,
    Firewall,
};

const MAX_HANDSHAKE_FRAME: usize = 4096;

const TRANSCRIPT_CONTEXT: &str = "keel v1 handshake transcript";
const INITIATOR_CONTEXT: &[u8] = b"keel v1 handshake initiator";
const RESPONDER_CONTEXT: &[u8] = b"keel v1 handshake responder";
const KEY_I2R_CONTEXT: &str = "keel v1 stream key initiator to responder";
const KEY_R2I_CONTEXT: &str = "keel v1 stream key responder to initiator";

/// Why a handshake did not produce a stream.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected peer {expected}, reached {got}")]
    PeerMismatch {
        expected: Box<PublicKey>,
        got: Box<PublicKey>,
    },
    #[error("handshake signature did not verify")]
    BadSignature,
    #[error("rejected by firewall")]
    Firewalled {
        claimed: Box<PublicKey>,
    },
    #[error("degenerate key exchange")]
    Crypto,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientHello {
    identity: PublicKey,
    eph: [u8; 32],
    payload: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerHello {
    identity: PublicKey,
    eph: [u8; 32],
    signature: Signature,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientAuth {
    signature: Signature,
}

/// Result of a completed handshake: directional ciphers plus the proven
/// remote identity and the initiator's application payload.
pub(crate) struct Handshake {
    pub(crate) send: Cipher,
    pub(crate) recv: Cipher,
    pub(crate) remote: PublicKey,
    pub(crate) payload: Bytes,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("remote", &self.remote)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

fn transcript(client: &ClientHello, server_identity: &PublicKey, server_eph: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(TRANSCRIPT_CONTEXT);
    hasher.update(client.identity.as_bytes());
    hasher.update(&client.eph);
    hasher.update(&(client.payload.len() as u64).to_le_bytes());
    hasher.update(&client.payload);
    hasher.update(server_identity.as_bytes());
    hasher.update(server_eph);
    *hasher.finalize().as_bytes()
}

fn signed_message(context: &[u8], transcript: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(context.len() + 32);
    msg.extend_from_slice(context);
    msg.extend_from_slice(transcript);
    msg
}

fn shared_secret(our_eph_secret: [u8; 32], their_eph: &[u8; 32]) -> Result<[u8; 32], HandshakeError> {
    let shared = MontgomeryPoint(*their_eph).mul_clamped(our_eph_secret);
    let bytes = shared.to_bytes();
    // A low-order remote point collapses the exchange to zero.
    if bytes == [0u8; 32] {
        return Err(HandshakeError::Crypto);
    }
    Ok(bytes)
}

fn derive_keys(shared: &[u8; 32], transcript: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut material = [0u8; 64];
    material[..32].copy_from_slice(shared);
    material[32..].copy_from_slice(transcript);
    (
        blake3::derive_key(KEY_I2R_CONTEXT, &material),
        blake3::derive_key(KEY_R2I_CONTEXT, &material),
    )
}

fn ephemeral() -> ([u8; 32], [u8; 32]) {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let public = MontgomeryPoint::mul_base_clamped(secret).to_bytes();
    (secret, public)
}

/// Run the initiator side. `expected` pins the remote identity when the
/// caller dialed a specific public key.
pub(crate) async fn initiate<IO>(
    io: &mut IO,
    secret: &SecretKey,
    expected: Option<PublicKey>,
    payload: Bytes,
) -> Result<Handshake, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (eph_secret, eph_public) = ephemeral();
    let hello = ClientHello {
        identity: secret.public(),
        eph: eph_public,
        payload,
    };
    write_frame(io, &hello).await?;

    let server: ServerHello = read_frame(io, MAX_HANDSHAKE_FRAME).await?;
    if let Some(expected) = expected {
        if expected != server.identity {
            return Err(HandshakeError::PeerMismatch {
                expected: Box::new(expected),
                got: Box::new(server.identity),
            });
        }
    }
    let transcript = transcript(&hello, &server.identity, &server.eph);
    server
        .identity
        .verify(
            &signed_message(RESPONDER_CONTEXT, &transcript),
            &server.signature,
        )
        .map_err(|_| HandshakeError::BadSignature)?;

    let shared = shared_secret(eph_secret, &server.eph)?;
    let (i2r, r2i) = derive_keys(&shared, &transcript);
    let mut send = Cipher::new(i2r);
    let recv = Cipher::new(r2i);

    let auth = ClientAuth {
        signature: secret.sign(&signed_message(INITIATOR_CONTEXT, &transcript)),
    };
    let auth_bytes =
        postcard::to_stdvec(&auth).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let sealed = send.seal(&auth_bytes).ok_or(HandshakeError::Crypto)?;
    write_raw_frame(io, &sealed).await?;

    trace!(remote = %server.identity.fmt_short(), "handshake complete (initiator)");
    Ok(Handshake {
        send,
        recv,
        remote: server.identity,
        payload: Bytes::new(),
    })
}

/// Run the responder side. The firewall decides on the claimed identity
/// and payload before a single byte is answered; a rejected initiator
/// learns nothing about this node.
pub(crate) async fn respond<IO>(
    io: &mut IO,
    secret: &SecretKey,
    firewall: Option<&Firewall>,
) -> Result<Handshake, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let hello: ClientHello = read_frame(io, MAX_HANDSHAKE_FRAME).await?;
    if let Some(firewall) = firewall {
        if !(**firewall)(&hello.identity, &hello.payload) {
            return Err(HandshakeError::Firewalled {
                claimed: Box::new(hello.identity),
            });
        }
    }

    let (eph_secret, eph_public) = ephemeral();
    let transcript = transcript(&hello, &secret.public(), &eph_public);
    let server = ServerHello {
        identity: secret.public(),
        eph: eph_public,
        signature: secret.sign(&signed_message(RESPONDER_CONTEXT, &transcript)),
    };
    write_frame(io, &server).await?;

    let shared = shared_secret(eph_secret, &hello.eph)?;
    let (i2r, r2i) = derive_keys(&shared, &transcript);
    let send = Cipher::new(r2i);
    let mut recv = Cipher::new(i2r);

    let sealed = read_raw_frame(io, MAX_HANDSHAKE_FRAME).await?;
    let auth_bytes = recv.open(&sealed).ok_or(HandshakeError::BadSignature)?;
    let auth: ClientAuth = postcard::from_bytes(&auth_bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    hello
        .identity
        .verify(
            &signed_message(INITIATOR_CONTEXT, &transcript),
            &auth.signature,
        )
        .map_err(|_| HandshakeError::BadSignature)?;

    trace!(remote = %hello.identity.fmt_short(), "handshake complete (responder)");
    Ok(Handshake {
        send,
        recv,
        remote: hello.identity,
        payload: hello.payload,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn run_pair(
        client_secret: SecretKey,
        server_secret: SecretKey,
        expected: Option<PublicKey>,
        firewall: Option<Firewall>,
    ) -> (
        Result<Handshake, HandshakeError>,
        Result<Handshake, HandshakeError>,
    ) {
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);
        let client = tokio::spawn(async move {
            initiate(
                &mut client_io,
                &client_secret,
                expected,
                Bytes::from_static(b"hello"),
            )
            .await
        });
        let server = tokio::spawn(async move {
            respond(&mut server_io, &server_secret, firewall.as_ref()).await
        });
        (client.await.unwrap(), server.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_proves_both_identities() {
        let client_secret = SecretKey::from_bytes(&[1u8; 32]);
        let server_secret = SecretKey::from_bytes(&[2u8; 32]);
        let (client, server) = run_pair(
            client_secret.clone(),
            server_secret.clone(),
            Some(server_secret.public()),
            None,
        )
        .await;
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.remote, server_secret.public());
        assert_eq!(server.remote, client_secret.public());
        assert_eq!(server.payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_encrypted_frames_cross() {
        let (client, server) = run_pair(
            SecretKey::from_bytes(&[1u8; 32]),
            SecretKey::from_bytes(&[2u8; 32]),
            None,
            None,
        )
        .await;
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        let sealed = client.send.seal(b"over the wire").unwrap();
        assert_ne!(&sealed[..], b"over the wire");
        assert_eq!(server.recv.open(&sealed).unwrap(), b"over the wire");

        let sealed = server.send.seal(b"and back").unwrap();
        assert_eq!(client.recv.open(&sealed).unwrap(), b"and back");
    }

    #[tokio::test]
    async fn test_wrong_server_identity_is_refused() {
        let impostor = SecretKey::from_bytes(&[3u8; 32]);
        let wanted = SecretKey::from_bytes(&[2u8; 32]).public();
        let (client, _server) = run_pair(
            SecretKey::from_bytes(&[1u8; 32]),
            impostor,
            Some(wanted),
            None,
        )
        .await;
        assert!(matches!(
            client.unwrap_err(),
            HandshakeError::PeerMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_firewall_rejects_before_response() {
        let firewall: Firewall = Arc::new(|_key, _payload| false);
        let (client, server) = run_pair(
            SecretKey::from_bytes(&[1u8; 32]),
            SecretKey::from_bytes(&[2u8; 32]),
            None,
            Some(firewall),
        )
        .await;
        assert!(matches!(
            server.unwrap_err(),
            HandshakeError::Firewalled { .. }
        ));
        // The initiator sees the stream end without a ServerHello.
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_firewall_sees_claimed_identity_and_payload() {
        let client_secret = SecretKey::from_bytes(&[1u8; 32]);
        let claimed = client_secret.public();
        let firewall: Firewall = Arc::new(move |key, payload| {
            *key == claimed && payload == b"hello"
        });
        let (client, server) = run_pair(
            client_secret,
            SecretKey::from_bytes(&[2u8; 32]),
            None,
            Some(firewall),
        )
        .await;
        assert!(client.is_ok());
        assert!(server.is_ok());
    }
}
