//! Authenticated encryption of stored values
//!
//! An envelope is `hex(iv):hex(tag):hex(ciphertext)` produced by AES-256-GCM
//! with a fresh 16-byte IV per call. Values that do not look like an envelope
//! are legacy plaintext and pass through `decrypt` unchanged.
//!
//! When a well-formed envelope fails authentication the codec, by default,
//! also returns the input unchanged and logs a warning. That keeps old
//! records readable but means a corrupted envelope degrades to garbage data
//! instead of an error; set `vault.strict_decrypt` to fail instead.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::key::EncryptionKey;
use crate::error::{HearthError, Result};

/// AES-256-GCM with a 128-bit nonce
type Cipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Encrypts and decrypts strings and JSON values under the process key
///
/// Cheap to clone; the key is shared read-only.
#[derive(Clone)]
pub struct EncryptionCodec {
    key: Arc<EncryptionKey>,
    strict: bool,
}

impl std::fmt::Debug for EncryptionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionCodec")
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl EncryptionCodec {
    pub fn new(key: Arc<EncryptionKey>) -> Self {
        Self { key, strict: false }
    }

    /// Fail with `TamperedOrWrongKey` instead of returning the input
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn cipher(&self) -> Cipher {
        Cipher::new(GenericArray::from_slice(self.key.as_bytes()))
    }

    /// Encrypt a string; the empty string stays empty
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher()
            .encrypt(GenericArray::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| HearthError::Serialization("encryption failed".to_string()))?;

        // aes-gcm appends the tag to the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt an envelope, passing legacy plaintext through unchanged
    pub fn decrypt(&self, data: &str) -> Result<String> {
        let Some((iv, tag, ciphertext)) = parse_envelope(data) else {
            return Ok(data.to_string());
        };

        match self.open(&iv, &tag, ciphertext) {
            Some(plaintext) => Ok(plaintext),
            None if self.strict => Err(HearthError::TamperedOrWrongKey),
            None => {
                tracing::warn!(
                    len = data.len(),
                    "Stored value failed authentication (tampered or wrong key); returning it unchanged"
                );
                Ok(data.to_string())
            }
        }
    }

    fn open(&self, iv: &[u8], tag: &[u8], ciphertext: Vec<u8>) -> Option<String> {
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return None;
        }
        let mut sealed = ciphertext;
        sealed.extend_from_slice(tag);
        let plain = self
            .cipher()
            .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
            .ok()?;
        String::from_utf8(plain).ok()
    }

    pub fn encrypt_object<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        self.encrypt(&serde_json::to_string(value)?)
    }

    pub fn decrypt_object<T: DeserializeOwned>(&self, data: &str) -> Result<T> {
        Ok(serde_json::from_str(&self.decrypt(data)?)?)
    }

    /// Same format check `decrypt` applies before attempting decryption
    pub fn is_encrypted(data: &str) -> bool {
        parse_envelope(data).is_some()
    }
}

/// Split and hex-decode the three envelope segments
fn parse_envelope(data: &str) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = data.split(':');
    let (iv, tag, ciphertext) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    if ![iv, tag, ciphertext].iter().all(|s| is_lower_hex(s)) {
        return None;
    }
    Some((
        hex::decode(iv).ok()?,
        hex::decode(tag).ok()?,
        hex::decode(ciphertext).ok()?,
    ))
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn codec() -> EncryptionCodec {
        EncryptionCodec::new(Arc::new(EncryptionKey::generate()))
    }

    /// Flip one hex digit to a different hex digit
    fn flip(c: char) -> char {
        if c == '0' { '1' } else { '0' }
    }

    fn flip_at(envelope: &str, index: usize) -> String {
        envelope
            .char_indices()
            .map(|(i, c)| if i == index { flip(c) } else { c })
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        for text in ["hello", "ünïcödé ✓ 日本語", "a:b:c", " ", "{\"json\":true}"] {
            let envelope = codec.encrypt(text).unwrap();
            assert_ne!(envelope, text);
            assert_eq!(codec.decrypt(&envelope).unwrap(), text);
        }
    }

    #[test]
    fn test_empty_string_is_a_no_op() {
        let codec = codec();
        assert_eq!(codec.encrypt("").unwrap(), "");
        assert_eq!(codec.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = codec().encrypt("secret").unwrap();
        let parts: Vec<&str> = envelope.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), "secret".len() * 2);
        assert!(EncryptionCodec::is_encrypted(&envelope));
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let codec = codec();
        let a = codec.encrypt("same").unwrap();
        let b = codec.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.split(':').next(), b.split(':').next());
    }

    #[test]
    fn test_single_character_flip_in_tag_or_ciphertext_returns_input() {
        let codec = codec();
        let envelope = codec.encrypt("the original message").unwrap();
        let tag_start = envelope.find(':').unwrap() + 1;

        // Every hex position after the IV: tag and ciphertext
        for index in tag_start..envelope.len() {
            if envelope.as_bytes()[index] == b':' {
                continue;
            }
            let tampered = flip_at(&envelope, index);
            assert_eq!(
                codec.decrypt(&tampered).unwrap(),
                tampered,
                "flip at {index} must not yield plaintext"
            );
        }
    }

    /// Lenient mode turns a corrupted envelope into corrupted data rather
    /// than an error. Callers relying on integrity should enable strict mode.
    #[test]
    fn test_lenient_tamper_fallback_is_silent_data_corruption() {
        let codec = codec();
        let envelope = codec.encrypt("balance=100").unwrap();
        let tampered = flip_at(&envelope, envelope.len() - 1);

        let read_back = codec.decrypt(&tampered).unwrap();
        assert_eq!(read_back, tampered);
        assert_ne!(read_back, "balance=100");
    }

    #[test]
    fn test_strict_mode_rejects_tampering() {
        let codec = codec().strict(true);
        let envelope = codec.encrypt("secret").unwrap();
        let tampered = flip_at(&envelope, envelope.len() - 1);
        assert!(matches!(
            codec.decrypt(&tampered),
            Err(HearthError::TamperedOrWrongKey)
        ));
        // Legacy plaintext still passes in strict mode
        assert_eq!(codec.decrypt("plain note").unwrap(), "plain note");
    }

    #[test]
    fn test_wrong_key_falls_back() {
        let envelope = codec().encrypt("secret").unwrap();
        let other = codec();
        assert_eq!(other.decrypt(&envelope).unwrap(), envelope);
        assert!(matches!(
            other.strict(true).decrypt(&envelope),
            Err(HearthError::TamperedOrWrongKey)
        ));
    }

    #[test]
    fn test_legacy_values_pass_through() {
        let codec = codec();
        for legacy in [
            "just text",
            "a:b",
            "ab:cd:ef:01",
            "AB:CD:EF",
            "ab::cd",
            "zz:yy:xx",
            "12:34:5g",
            "http://example.com",
        ] {
            assert_eq!(codec.decrypt(legacy).unwrap(), legacy);
            assert!(!EncryptionCodec::is_encrypted(legacy), "{legacy}");
        }
    }

    #[test]
    fn test_well_formed_but_wrong_lengths_fall_back() {
        let codec = codec();
        // Looks like an envelope but the IV is two bytes
        assert!(EncryptionCodec::is_encrypted("abcd:ef01:2345"));
        assert_eq!(codec.decrypt("abcd:ef01:2345").unwrap(), "abcd:ef01:2345");
        // Odd-length hex cannot be decoded at all
        assert!(!EncryptionCodec::is_encrypted("abc:def:012"));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_object_round_trip() {
        let codec = codec();
        let note = Note {
            title: "groceries".to_string(),
            tags: vec!["home".to_string()],
        };
        let envelope = codec.encrypt_object(&note).unwrap();
        assert!(EncryptionCodec::is_encrypted(&envelope));
        let back: Note = codec.decrypt_object(&envelope).unwrap();
        assert_eq!(back, note);
    }

    #[test]
    fn test_decrypt_object_reads_legacy_json() {
        let back: Note = codec()
            .decrypt_object(r#"{"title":"old","tags":[]}"#)
            .unwrap();
        assert_eq!(back.title, "old");
    }
}
