//! Cryptographic primitives for cairn.
//!
//! Provides two things:
//!   1. A symmetric stream cipher (AES-256-CTR) for replicated payloads
//!   2. Random identifiers for node namespaces
//!
//! Encrypted streams are laid out as:
//!
//! ```text
//! [IV (16 bytes, cleartext)] [ciphertext (same length as plaintext)]
//! ```
//!
//! CTR mode needs no padding, so ciphertext length always equals plaintext
//! length. Key material derives ZeroizeOnDrop.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// Initialization vector length, written in clear ahead of the ciphertext.
pub const IV_LEN: usize = 16;

const COPY_BUF_LEN: usize = 32 * 1024;

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Symmetric key used for replicated payloads.
///
/// Generated once per server and held for the life of the process.
/// Never persisted, never rotated.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Build a key from raw bytes. Anything other than 32 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self, iv: &[u8; IV_LEN]) -> Result<Aes256Ctr, CipherError> {
        Aes256Ctr::new_from_slices(&self.0, iv)
            .map_err(|_| CipherError::InvalidKeyLength(self.0.len()))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Generate a random 32-byte identifier, hex-encoded.
///
/// Used as a node's storage namespace when none is configured.
pub fn generate_id() -> String {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Encrypt everything `src` yields into `dst`.
///
/// A fresh random IV is written first, then the ciphertext. Returns the
/// total number of bytes written to `dst`: `16 + plaintext length`.
pub async fn encrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut cipher = key.cipher(&iv)?;

    dst.write_all(&iv).await?;
    let n = apply_stream(&mut cipher, src, dst).await?;
    Ok(IV_LEN as u64 + n)
}

/// Decrypt an IV-prefixed stream from `src` into `dst`.
///
/// Returns the number of bytes consumed from `src` (`16 + ciphertext
/// length`), matching what `encrypt_stream` reported on the other side.
pub async fn decrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CipherError::TooShort,
        _ => CipherError::Io(e),
    })?;
    let mut cipher = key.cipher(&iv)?;

    let n = apply_stream(&mut cipher, src, dst).await?;
    Ok(IV_LEN as u64 + n)
}

/// Encrypt an in-memory buffer. Convenience for payloads that are already
/// fully captured.
pub async fn encrypt_bytes(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut src = plaintext;
    let mut out = Vec::with_capacity(IV_LEN + plaintext.len());
    encrypt_stream(key, &mut src, &mut out).await?;
    Ok(out)
}

/// XOR the keystream over `src`, writing to `dst`. Same operation both ways.
async fn apply_stream<R, W>(
    cipher: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ciphertext too short (need at least {} bytes of IV)", IV_LEN)]
    TooShort,

    #[error("invalid key length {0}, expected {}", KEY_LEN)]
    InvalidKeyLength(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
