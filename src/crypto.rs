use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Optional sealing of message payloads, applied per buffer before framing and after
///  de-duplication on the receive side. Retransmitted packets carry the sealed bytes
///  unchanged, so a message is sealed exactly once no matter how often it travels.
pub trait PayloadCrypto: Send + Sync + 'static {
    fn encrypt(&self, plaintext: Bytes) -> Bytes;

    fn decrypt(&self, sealed: Bytes) -> Result<Bytes, ProtocolError>;
}

pub struct NoCrypto;
impl PayloadCrypto for NoCrypto {
    fn encrypt(&self, plaintext: Bytes) -> Bytes {
        plaintext
    }

    fn decrypt(&self, sealed: Bytes) -> Result<Bytes, ProtocolError> {
        Ok(sealed)
    }
}

/// AES-256-GCM with a `[4 bytes fixed][8 bytes counter]` nonce prefixed to each sealed
///  buffer. The fixed part is random per process so two endpoints sharing a key never
///  collide on nonces.
pub struct Aes256GcmCrypto {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl Aes256GcmCrypto {
    const NONCE_LEN: usize = 12;

    pub fn new(key: &[u8; 32]) -> Aes256GcmCrypto {
        let fixed_bytes: [u8; 4] = Uuid::new_v4().into_bytes()[..4]
            .try_into()
            .expect("slice of a fixed-size array");

        Aes256GcmCrypto {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_fixed: u32::from_be_bytes(fixed_bytes),
            nonce_counter: AtomicU64::new(0),
        }
    }

    fn next_nonce(&self) -> [u8; Self::NONCE_LEN] {
        let mut nonce = [0u8; Self::NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(&self.nonce_counter.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        nonce
    }
}

impl PayloadCrypto for Aes256GcmCrypto {
    fn encrypt(&self, plaintext: Bytes) -> Bytes {
        let nonce_bytes = self.next_nonce();
        let ciphertext = self.cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .expect("AES-GCM encryption of an in-memory buffer cannot fail");

        let mut sealed = BytesMut::with_capacity(Self::NONCE_LEN + ciphertext.len());
        sealed.put_slice(&nonce_bytes);
        sealed.put_slice(&ciphertext);
        sealed.freeze()
    }

    fn decrypt(&self, sealed: Bytes) -> Result<Bytes, ProtocolError> {
        if sealed.len() < Self::NONCE_LEN {
            return Err(ProtocolError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(Self::NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map(Bytes::from)
            .map_err(|_| ProtocolError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_no_crypto_is_identity() {
        let crypto = NoCrypto;
        let buf = Bytes::from_static(b"hello");
        assert_eq!(crypto.encrypt(buf.clone()), buf);
        assert_eq!(crypto.decrypt(buf.clone()).unwrap(), buf);
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::short(b"hi".as_slice())]
    #[case::longer(&[42u8; 4096])]
    fn test_aes_round_trip(#[case] plaintext: &[u8]) {
        let crypto = Aes256GcmCrypto::new(&[7; 32]);
        let sealed = crypto.encrypt(Bytes::copy_from_slice(plaintext));

        assert_ne!(sealed.as_ref(), plaintext);
        assert_eq!(crypto.decrypt(sealed).unwrap().as_ref(), plaintext);
    }

    #[test]
    fn test_aes_nonces_are_unique() {
        let crypto = Aes256GcmCrypto::new(&[7; 32]);
        let a = crypto.encrypt(Bytes::from_static(b"same"));
        let b = crypto.encrypt(Bytes::from_static(b"same"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes_rejects_tampering() {
        let crypto = Aes256GcmCrypto::new(&[7; 32]);
        let sealed = crypto.encrypt(Bytes::from_static(b"payload"));

        let mut tampered = sealed.to_vec();
        *tampered.last_mut().unwrap() ^= 1;
        assert_eq!(crypto.decrypt(Bytes::from(tampered)), Err(ProtocolError::DecryptFailed));
    }

    #[test]
    fn test_aes_rejects_wrong_key() {
        let sealed = Aes256GcmCrypto::new(&[7; 32]).encrypt(Bytes::from_static(b"payload"));
        assert_eq!(
            Aes256GcmCrypto::new(&[8; 32]).decrypt(sealed),
            Err(ProtocolError::DecryptFailed)
        );
    }

    #[test]
    fn test_aes_rejects_truncated_input() {
        let crypto = Aes256GcmCrypto::new(&[7; 32]);
        assert_eq!(crypto.decrypt(Bytes::from_static(b"short")), Err(ProtocolError::DecryptFailed));
    }
}
