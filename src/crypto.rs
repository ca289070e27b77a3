//! Transparent per-page AES-256-GCM encryption (spec §4.9). Sits below the
//! cache and above raw file I/O: every page read is decrypted on the way in
//! and every page write is encrypted on the way out, except page 1's
//! 100-byte database header, which always stays plaintext so the format
//! stays self-describing and so the KDF parameters the header itself
//! carries (`page::header::KDF_SLOT_OFFSET`) can be read before a key
//! exists to decrypt anything with. Only page 1's b-tree content (the
//! bytes past the header) is encrypted like any other page's body.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;

use crate::error::{Error, Result};
use crate::page::header::{KdfParams, HEADER_SIZE, HEADER_STRING};

/// Bytes appended after the ciphertext: a 16-byte GCM tag plus a 4-byte
/// counter (the low 32 bits of the nonce; the high 64 bits are the page
/// number and never need to be stored). Rounded up to a 32-byte reserved
/// region so page-size arithmetic stays nicely aligned.
pub const CRYPTO_OVERHEAD: usize = 32;
const TAG_LEN: usize = 16;
const COUNTER_LEN: usize = 4;

pub struct PageCipher {
    cipher: Aes256Gcm,
}

impl PageCipher {
    /// Derives the page key from `password` using Argon2id, with the salt
    /// fixed to the plaintext magic prologue (spec §4.9 -- the engine's
    /// resolved Open Question (i) parameter layout is in `page::header`).
    pub fn derive(password: &[u8], params: KdfParams) -> Result<Self> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism as u32,
                Some(32),
            )
            .map_err(|e| Error::CryptoError {
                page: 1,
                reason: format!("invalid KDF parameters: {e}"),
            })?,
        );

        let mut key_bytes = [0u8; 32];
        argon2
            .hash_password_into(password, &HEADER_STRING, &mut key_bytes)
            .map_err(|e| Error::CryptoError {
                page: 1,
                reason: format!("key derivation failed: {e}"),
            })?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self { cipher })
    }

    fn nonce_bytes(page_number: u32, counter: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0..8].copy_from_slice(&(page_number as u64).to_le_bytes());
        nonce[8..12].copy_from_slice(&counter.to_le_bytes());
        nonce
    }

    /// Encrypts one page's plaintext body into `[ciphertext || tag ||
    /// counter]`, leaving the first 16 bytes of page 1 untouched by the
    /// caller (this function only ever sees the part that gets encrypted).
    pub fn encrypt_page(&self, page_number: u32, counter: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = Self::nonce_bytes(page_number, counter);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphertext =
            self.cipher
                .encrypt(nonce, plaintext)
                .map_err(|_| Error::CryptoError {
                    page: page_number,
                    reason: "encryption failed".into(),
                })?;
        // `aes_gcm::encrypt` already appends the tag; we only need to add
        // the counter so decryption can reconstruct the nonce.
        ciphertext.extend_from_slice(&counter.to_le_bytes());
        Ok(ciphertext)
    }

    /// Decrypts a `[ciphertext || tag || counter]` blob back to plaintext.
    /// Any tag mismatch (including a single flipped bit anywhere in the
    /// page) surfaces as `CryptoError` and never returns partial plaintext.
    pub fn decrypt_page(&self, page_number: u32, encrypted: &[u8]) -> Result<(Vec<u8>, u32)> {
        if encrypted.len() < TAG_LEN + COUNTER_LEN {
            return Err(Error::CryptoError {
                page: page_number,
                reason: "encrypted page too short".into(),
            });
        }
        let (body, counter_bytes) = encrypted.split_at(encrypted.len() - COUNTER_LEN);
        let counter = u32::from_le_bytes(counter_bytes.try_into().unwrap());

        let nonce_bytes = Self::nonce_bytes(page_number, counter);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, body)
            .map_err(|_| Error::CryptoError {
                page: page_number,
                reason: "authentication tag mismatch".into(),
            })?;

        Ok((plaintext, counter))
    }

    /// Decrypts a whole on-disk page (full `page_size` bytes, reserved
    /// region included) back to a `usable_size`-length plaintext buffer.
    /// Page 1's 100-byte header is never encrypted and is copied through
    /// verbatim (spec §4.9); everything past it (its b-tree content, for
    /// page 1, or the whole body for any other page) is AEAD-decrypted.
    pub fn decrypt_full_page(
        &self,
        page_number: u32,
        raw: &[u8],
        usable_size: usize,
    ) -> Result<(Vec<u8>, u32)> {
        if page_number == 1 {
            let header = &raw[0..HEADER_SIZE];
            let (rest, counter) = self.decrypt_page(page_number, &raw[HEADER_SIZE..])?;
            let mut out = Vec::with_capacity(usable_size);
            out.extend_from_slice(header);
            out.extend_from_slice(&rest);
            Ok((out, counter))
        } else {
            self.decrypt_page(page_number, raw)
        }
    }

    /// Encrypts a `usable_size`-length plaintext page into a full on-disk
    /// `page_size` buffer, using `counter` (the caller is responsible for
    /// never reusing a counter for the same page number under the same
    /// key -- spec §4.9's nonce uniqueness requirement).
    pub fn encrypt_full_page(
        &self,
        page_number: u32,
        counter: u32,
        plaintext: &[u8],
        page_size: usize,
    ) -> Result<Vec<u8>> {
        let mut out = if page_number == 1 {
            let mut encrypted = self.encrypt_page(page_number, counter, &plaintext[HEADER_SIZE..])?;
            let mut buf = Vec::with_capacity(HEADER_SIZE + encrypted.len());
            buf.extend_from_slice(&plaintext[0..HEADER_SIZE]);
            buf.append(&mut encrypted);
            buf
        } else {
            self.encrypt_page(page_number, counter, plaintext)?
        };
        out.resize(page_size, 0);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> KdfParams {
        // Small parameters so unit tests run fast; production defaults live
        // in `KdfParams::default`.
        KdfParams {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = PageCipher::derive(b"correct horse", test_params()).unwrap();
        let plaintext = vec![0x42u8; 4096 - CRYPTO_OVERHEAD];

        let encrypted = cipher.encrypt_page(5, 0, &plaintext).unwrap();
        let (decrypted, counter) = cipher.decrypt_page(5, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_wrong_password_fails() {
        let right = PageCipher::derive(b"pw", test_params()).unwrap();
        let wrong = PageCipher::derive(b"not-pw", test_params()).unwrap();

        let encrypted = right.encrypt_page(1, 0, b"secret payload..").unwrap();
        assert!(wrong.decrypt_page(1, &encrypted).is_err());
    }

    #[test]
    fn test_bit_flip_is_detected() {
        let cipher = PageCipher::derive(b"pw", test_params()).unwrap();
        let mut encrypted = cipher.encrypt_page(2, 3, b"0123456789abcdef").unwrap();
        encrypted[0] ^= 0x01;
        assert!(matches!(
            cipher.decrypt_page(2, &encrypted),
            Err(Error::CryptoError { page: 2, .. })
        ));
    }

    #[test]
    fn test_full_page_round_trip_preserves_page_one_header() {
        let cipher = PageCipher::derive(b"pw", test_params()).unwrap();
        let usable = 4096 - CRYPTO_OVERHEAD;
        let mut plaintext = vec![0u8; usable];
        plaintext[0..16].copy_from_slice(&crate::page::header::HEADER_STRING);
        plaintext[HEADER_SIZE + 4] = 0xAB;

        let encrypted = cipher
            .encrypt_full_page(1, 0, &plaintext, 4096)
            .unwrap();
        assert_eq!(encrypted.len(), 4096);
        assert_eq!(&encrypted[0..HEADER_SIZE], &plaintext[0..HEADER_SIZE]);

        let (decrypted, counter) = cipher.decrypt_full_page(1, &encrypted, usable).unwrap();
        assert_eq!(decrypted, plaintext);
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_counter_increment_changes_ciphertext() {
        let cipher = PageCipher::derive(b"pw", test_params()).unwrap();
        let plaintext = b"identical plaintext payload....";
        let a = cipher.encrypt_page(9, 0, plaintext).unwrap();
        let b = cipher.encrypt_page(9, 1, plaintext).unwrap();
        assert_ne!(a, b);
    }
}
