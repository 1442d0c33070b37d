//! Encrypted byte streams.
//!
//! A [`SecureStream`] wraps an ordered transport with the directional
//! ciphers a handshake produced. Plaintext is cut into frames, each
//! sealed with ChaCha20-Poly1305 under a counter nonce; tampering or
//! reordering on the wire surfaces as an error, not as corrupt data.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

/// Per-frame plaintext bound. Keeps a frame within one UDP-sized page of
/// overhead amortization without buffering large writes.
const MAX_PLAINTEXT_FRAME: usize = 16 * 1024;
/// Ciphertext bound accepted from the wire: plaintext + AEAD tag.
const MAX_CIPHERTEXT_FRAME: usize = MAX_PLAINTEXT_FRAME + 16;

/// One direction of an established stream: an AEAD with a counter nonce.
pub(crate) struct Cipher {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl Cipher {
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
            counter: 0,
        }
    }

    fn nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        *Nonce::from_slice(&bytes)
    }

    /// Encrypt one frame. `None` only on allocation failure inside the
    /// AEAD, which callers treat as a fatal stream error.
    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.nonce();
        self.aead.encrypt(&nonce, plaintext).ok()
    }

    /// Decrypt one frame. `None` means the ciphertext did not
    /// authenticate under the expected nonce.
    pub(crate) fn open(&mut self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.nonce();
        self.aead.decrypt(&nonce, ciphertext).ok()
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("counter", &self.counter).finish()
    }
}

enum ReadState {
    /// Reading the 4-byte length prefix.
    Len { buf: [u8; 4], filled: usize },
    /// Reading the ciphertext body.
    Body { buf: Vec<u8>, filled: usize },
}

/// An authenticated, encrypted byte stream over `IO`.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]; the framing and
/// cryptography are invisible to the user. A paused stream (see
/// [`SecureStream::set_pause`]) stops exchanging data without losing
/// state.
pub struct SecureStream<IO> {
    io: IO,
    send: Cipher,
    recv: Cipher,
    /// Decrypted bytes not yet handed to the reader.
    plain: BytesMut,
    read_state: ReadState,
    /// Encrypted bytes not yet written out (length prefix included).
    write_out: BytesMut,
    pause: Option<watch::Receiver<bool>>,
    pause_wait: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl<IO> SecureStream<IO> {
    pub(crate) fn new(io: IO, send: Cipher, recv: Cipher) -> Self {
        Self {
            io,
            send,
            recv,
            plain: BytesMut::new(),
            read_state: ReadState::Len {
                buf: [0; 4],
                filled: 0,
            },
            write_out: BytesMut::new(),
            pause: None,
            pause_wait: None,
        }
    }

    /// Attach a pause signal. While the watched value is `true`, reads
    /// and writes suspend; flipping it back resumes them where they
    /// stopped.
    pub fn set_pause(&mut self, pause: watch::Receiver<bool>) {
        self.pause = Some(pause);
    }

    /// Poll the pause signal; `Poll::Pending` while paused.
    fn poll_pause(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(rx) = &self.pause else {
            return Poll::Ready(());
        };
        if !*rx.borrow() {
            self.pause_wait = None;
            return Poll::Ready(());
        }
        let wait = self.pause_wait.get_or_insert_with(|| {
            let mut rx = rx.clone();
            Box::pin(async move {
                while *rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
        });
        match wait.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.pause_wait = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<IO: std::fmt::Debug> std::fmt::Debug for SecureStream<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream").field("io", &self.io).finish()
    }
}

impl<IO> AsyncRead for SecureStream<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_pause(cx));
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(out.remaining());
                out.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            match &mut this.read_state {
                ReadState::Len { buf, filled } => {
                    let mut read_buf = ReadBuf::new(&mut buf[*filled..]);
                    std::task::ready!(Pin::new(&mut this.io).poll_read(cx, &mut read_buf))?;
                    let n = read_buf.filled().len();
                    if n == 0 {
                        if *filled == 0 {
                            // Clean end of stream between frames.
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    *filled += n;
                    if *filled == 4 {
                        let len = u32::from_be_bytes(*buf) as usize;
                        if len > MAX_CIPHERTEXT_FRAME {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("frame of {len} bytes exceeds limit"),
                            )));
                        }
                        this.read_state = ReadState::Body {
                            buf: vec![0u8; len],
                            filled: 0,
                        };
                    }
                }
                ReadState::Body { buf, filled } => {
                    if *filled < buf.len() {
                        let mut read_buf = ReadBuf::new(&mut buf[*filled..]);
                        std::task::ready!(Pin::new(&mut this.io).poll_read(cx, &mut read_buf))?;
                        let n = read_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    if *filled == buf.len() {
                        let plaintext = this.recv.open(buf).ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::InvalidData,
                                "frame failed authentication",
                            )
                        })?;
                        this.plain.extend_from_slice(&plaintext);
                        this.read_state = ReadState::Len {
                            buf: [0; 4],
                            filled: 0,
                        };
                    }
                }
            }
        }
    }
}

impl<IO> AsyncWrite for SecureStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_pause(cx));
        // Drain previously sealed bytes before accepting more, bounding
        // the buffer to roughly one frame.
        while !this.write_out.is_empty() {
            let n = std::task::ready!(Pin::new(&mut this.io).poll_write(cx, &this.write_out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_out.advance(n);
        }
        let chunk = buf.len().min(MAX_PLAINTEXT_FRAME);
        let sealed = this.send.seal(&buf[..chunk]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "encryption failure")
        })?;
        this.write_out
            .extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        this.write_out.extend_from_slice(&sealed);
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_pause(cx));
        while !this.write_out.is_empty() {
            let n = std::task::ready!(Pin::new(&mut this.io).poll_write(cx, &this.write_out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_out.advance(n);
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        std::task::ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn cipher_pair() -> (Cipher, Cipher) {
        let key = [7u8; 32];
        (Cipher::new(key), Cipher::new(key))
    }

    fn stream_pair() -> (
        SecureStream<tokio::io::DuplexStream>,
        SecureStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let key_ab = [1u8; 32];
        let key_ba = [2u8; 32];
        let left = SecureStream::new(a, Cipher::new(key_ab), Cipher::new(key_ba));
        let right = SecureStream::new(b, Cipher::new(key_ba), Cipher::new(key_ab));
        (left, right)
    }

    #[test]
    fn test_cipher_seal_open() {
        let (mut seal, mut open) = cipher_pair();
        let ct = seal.seal(b"secret").unwrap();
        assert_ne!(&ct[..], b"secret");
        assert_eq!(open.open(&ct).unwrap(), b"secret");
    }

    #[test]
    fn test_cipher_rejects_replayed_frame() {
        let (mut seal, mut open) = cipher_pair();
        let first = seal.seal(b"one").unwrap();
        assert!(open.open(&first).is_some());
        // Same ciphertext again decrypts under the wrong counter.
        assert!(open.open(&first).is_none());
    }

    #[test]
    fn test_cipher_rejects_tampering() {
        let (mut seal, mut open) = cipher_pair();
        let mut ct = seal.seal(b"data").unwrap();
        ct[0] ^= 0x01;
        assert!(open.open(&ct).is_none());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut left, mut right) = stream_pair();
        left.write_all(b"ahoy from the left").await.unwrap();
        left.flush().await.unwrap();
        let mut buf = [0u8; 18];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ahoy from the left");

        right.write_all(b"and back").await.unwrap();
        right.flush().await.unwrap();
        let mut buf = [0u8; 8];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");
    }

    #[tokio::test]
    async fn test_large_transfer_spans_frames() {
        let (mut left, mut right) = stream_pair();
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            left.write_all(&payload).await.unwrap();
            left.flush().await.unwrap();
            left
        });
        let mut got = vec![0u8; expected.len()];
        right.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_blocks_and_resume_releases() {
        let (mut left, mut right) = stream_pair();
        let (pause_tx, pause_rx) = watch::channel(true);
        left.set_pause(pause_rx);

        let write = tokio::spawn(async move {
            left.write_all(b"deferred").await.unwrap();
            left.flush().await.unwrap();
            left
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!write.is_finished(), "paused stream must not write");

        pause_tx.send(false).unwrap();
        write.await.unwrap();
        let mut buf = [0u8; 8];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"deferred");
    }
}
