//! The payload envelope applied on top of the RTP framing.
//!
//! Two modes share one call surface so the engines never need to know which
//! is active: [`Envelope::Aead`] (ChaCha20-Poly1305, real confidentiality and
//! integrity) and [`Envelope::Xor`] (a repeating-key XOR, obfuscation only,
//! explicitly not a security property). [`Envelope::None`] is a no-op for
//! when no key is configured at all.

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};

/// Nonce length for the AEAD mode, transmitted in the clear on the wire.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length appended after the nonce.
pub const TAG_LEN: usize = 16;

/// Combined per-packet overhead of the AEAD envelope (nonce + tag).
pub const AEAD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Minimum key length accepted by XOR mode; shorter keys make the repeating
/// pattern trivially visible in a handful of packets.
pub const MIN_XOR_KEY_LEN: usize = 16;

/// Which envelope mode the caller asked for, independent of whether a key
/// was actually supplied (no key ⇒ always [`Envelope::None`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// ChaCha20-Poly1305 authenticated encryption (default).
    Aead,
    /// Repeating-key XOR obfuscation, no integrity.
    Xor,
}

/// An active envelope, bound to at most one mode for the lifetime of a run.
/// Client and server must agree on both the key and the mode; a mismatch
/// manifests as persistent tag failures or garbled RTP headers, never a
/// crash.
#[derive(Clone)]
pub enum Envelope {
    None,
    Xor(Vec<u8>),
    // Wrapped in `Arc` rather than relying on `ChaCha20Poly1305` being
    // `Clone`: one sub-flow task is spawned per server sub-flow and each
    // needs its own handle to the same cipher without re-deriving it.
    Aead(Arc<ChaCha20Poly1305>),
}

/// Why an envelope failed to open a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// Too short to contain the mode's fixed overhead (nonce + tag for AEAD).
    Truncated,
    /// The AEAD tag did not verify; the packet is dropped, never retried.
    AuthenticationFailed,
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "envelope shorter than its fixed overhead"),
            Self::AuthenticationFailed => write!(f, "AEAD tag verification failed"),
        }
    }
}

impl Envelope {
    /// Builds the envelope for a decoded key (or none) and requested mode.
    /// `key` must already be 16 or 32 raw bytes; see [`crate::key::decode`].
    pub fn new(key: Option<&[u8]>, mode: Mode) -> anyhow::Result<Self> {
        let Some(key) = key else {
            return Ok(Self::None);
        };

        Ok(match mode {
            Mode::Aead => {
                anyhow::ensure!(
                    key.len() == 16 || key.len() == 32,
                    "AEAD key must be 16 or 32 bytes, got {}",
                    key.len()
                );
                // chacha20poly1305's Key type is fixed at 32 bytes; a 16-byte
                // key is accepted on the CLI for symmetry with XOR mode but
                // AEAD itself always wants the full 256-bit key.
                anyhow::ensure!(
                    key.len() == 32,
                    "AEAD mode requires a 256-bit (32-byte) key; use --cipher xor for a 128-bit key"
                );
                Self::Aead(Arc::new(ChaCha20Poly1305::new(Key::from_slice(key))))
            }
            Mode::Xor => {
                anyhow::ensure!(
                    key.len() >= MIN_XOR_KEY_LEN,
                    "XOR key must be at least {MIN_XOR_KEY_LEN} bytes, got {}",
                    key.len()
                );
                Self::Xor(key.to_vec())
            }
        })
    }

    /// Appends the enveloped form of `plaintext` to `out`. For AEAD this is
    /// `ciphertext || nonce || tag`; for XOR it is the obfuscated payload in
    /// place; for `None` it is `plaintext` unchanged.
    pub fn seal(&self, plaintext: &[u8], out: &mut BytesMut) {
        match self {
            Self::None => out.put_slice(plaintext),
            Self::Xor(key) => {
                let start = out.len();
                out.put_slice(plaintext);
                xor_in_place(&mut out[start..], key);
            }
            Self::Aead(cipher) => {
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                // RustCrypto's `encrypt` returns `ciphertext || tag`; the
                // wire format wants `ciphertext || nonce || tag`, so the tag
                // is split off and re-appended after the nonce.
                let mut sealed = cipher
                    .encrypt(&nonce, plaintext)
                    .expect("chacha20poly1305 encryption cannot fail for valid key/nonce sizes");
                let tag = sealed.split_off(sealed.len() - TAG_LEN);
                out.put_slice(&sealed);
                out.put_slice(&nonce);
                out.put_slice(&tag);
            }
        }
    }

    /// Appends the opened form of `wire` (everything after the RTP header)
    /// to `out`. Returns an error without touching `out` on failure; the
    /// caller drops the packet and logs a warning.
    pub fn open(&self, wire: &[u8], out: &mut BytesMut) -> Result<(), OpenError> {
        match self {
            Self::None => {
                out.put_slice(wire);
                Ok(())
            }
            Self::Xor(key) => {
                let start = out.len();
                out.put_slice(wire);
                xor_in_place(&mut out[start..], key);
                Ok(())
            }
            Self::Aead(cipher) => {
                if wire.len() < AEAD_OVERHEAD {
                    return Err(OpenError::Truncated);
                }

                let ct_len = wire.len() - AEAD_OVERHEAD;
                let ciphertext = &wire[..ct_len];
                let nonce_bytes = &wire[ct_len..ct_len + NONCE_LEN];
                let tag = &wire[ct_len + NONCE_LEN..];

                let mut combined = Vec::with_capacity(ct_len + TAG_LEN);
                combined.extend_from_slice(ciphertext);
                combined.extend_from_slice(tag);

                let nonce = Nonce::from_slice(nonce_bytes);
                let plaintext = cipher
                    .decrypt(nonce, combined.as_slice())
                    .map_err(|_| OpenError::AuthenticationFailed)?;

                out.put_slice(&plaintext);
                Ok(())
            }
        }
    }
}

fn xor_in_place(buf: &mut [u8], key: &[u8]) {
    for (byte, k) in buf.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_round_trips_unchanged() {
        let envelope = Envelope::new(None, Mode::Aead).unwrap();
        let mut sealed = BytesMut::new();
        envelope.seal(b"hello", &mut sealed);
        assert_eq!(&sealed[..], b"hello");

        let mut opened = BytesMut::new();
        envelope.open(&sealed, &mut opened).unwrap();
        assert_eq!(&opened[..], b"hello");
    }

    #[test]
    fn xor_round_trips_and_is_reversible_with_same_key() {
        let key = vec![7u8; MIN_XOR_KEY_LEN];
        let envelope = Envelope::new(Some(&key), Mode::Xor).unwrap();

        let mut sealed = BytesMut::new();
        envelope.seal(b"tunneled payload", &mut sealed);
        assert_ne!(&sealed[..], b"tunneled payload");

        let mut opened = BytesMut::new();
        envelope.open(&sealed, &mut opened).unwrap();
        assert_eq!(&opened[..], b"tunneled payload");
    }

    #[test]
    fn xor_rejects_short_key() {
        let key = vec![1u8; MIN_XOR_KEY_LEN - 1];
        assert!(Envelope::new(Some(&key), Mode::Xor).is_err());
    }

    #[test]
    fn aead_round_trips() {
        let key = [9u8; 32];
        let envelope = Envelope::new(Some(&key), Mode::Aead).unwrap();

        let mut sealed = BytesMut::new();
        envelope.seal(b"secret payload", &mut sealed);
        assert_eq!(sealed.len(), "secret payload".len() + AEAD_OVERHEAD);

        let mut opened = BytesMut::new();
        envelope.open(&sealed, &mut opened).unwrap();
        assert_eq!(&opened[..], b"secret payload");
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let key = [3u8; 32];
        let envelope = Envelope::new(Some(&key), Mode::Aead).unwrap();

        let mut sealed = BytesMut::new();
        envelope.seal(b"secret payload", &mut sealed);
        sealed[0] ^= 0xff;

        let mut opened = BytesMut::new();
        assert_eq!(
            envelope.open(&sealed, &mut opened),
            Err(OpenError::AuthenticationFailed)
        );
        assert!(opened.is_empty());
    }

    #[test]
    fn aead_rejects_128_bit_key() {
        let key = [1u8; 16];
        assert!(Envelope::new(Some(&key), Mode::Aead).is_err());
    }
}
