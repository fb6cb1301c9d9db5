//! Sealing of identity, counter and update-code records.
//!
//! Sealed layout: `nonce (24 bytes) || XChaCha20-Poly1305 ciphertext+tag`.
//! The purpose label is authenticated as associated data so a blob sealed
//! for one record kind never opens as another.

use base64::Engine;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::CounterError;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const KEY_DOMAIN: &[u8] = b"usage-counter/shared-secret/v1";
const MIN_SECRET_MATERIAL: usize = 16;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SealPurpose {
    Identity,
    Counter,
    UpdateCode,
}

impl SealPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Counter => "counter",
            Self::UpdateCode => "update-code",
        }
    }
}

/// Process-wide application secret. Loaded once from a trusted local source
/// and passed explicitly to every encode/decode call.
#[derive(Clone)]
pub struct SharedSecret {
    key: [u8; 32],
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl SharedSecret {
    /// Derives the cipher key from raw secret material (file contents).
    ///
    /// # Errors
    /// Returns [`CounterError::Configuration`] when fewer than 16 bytes of
    /// material remain after trimming whitespace.
    pub fn from_material(material: &[u8]) -> Result<Self, CounterError> {
        let trimmed = trim_ascii_whitespace(material);
        if trimmed.len() < MIN_SECRET_MATERIAL {
            return Err(CounterError::Configuration(format!(
                "shared secret material MUST be at least {MIN_SECRET_MATERIAL} bytes"
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(trimmed);
        Ok(Self {
            key: hasher.finalize().into(),
        })
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] if the cipher rejects the input.
    pub fn seal(&self, purpose: SealPurpose, plaintext: &[u8]) -> Result<Vec<u8>, CounterError> {
        let mut nonce = [0_u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: purpose.as_str().as_bytes(),
                },
            )
            .map_err(|_| CounterError::Format(format!("failed to seal {}", purpose.as_str())))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a blob produced by [`SharedSecret::seal`].
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] for short input, a wrong key, a wrong
    /// purpose or any modified byte.
    pub fn open(&self, purpose: SealPurpose, sealed: &[u8]) -> Result<Vec<u8>, CounterError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CounterError::Format(format!(
                "sealed {} is too short: {} bytes",
                purpose.as_str(),
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: purpose.as_str().as_bytes(),
                },
            )
            .map_err(|_| {
                CounterError::Format(format!(
                    "failed to decrypt {}: wrong key or damaged blob",
                    purpose.as_str()
                ))
            })
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |index| index + 1);
    &bytes[start..end]
}

/// Encodes a sealed blob for out-of-band delivery (email, support ticket).
#[must_use]
pub fn to_transport(sealed: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(sealed)
}

/// Decodes transport text, tolerating surrounding and embedded whitespace
/// introduced by mail clients.
///
/// # Errors
/// Returns [`CounterError::Format`] when the text is not valid base64.
pub fn from_transport(text: &str) -> Result<Vec<u8>, CounterError> {
    let compact: String = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| CounterError::Format(format!("invalid transport encoding: {err}")))
}
