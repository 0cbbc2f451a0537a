//! RustCrypto-backed implementation of the crypto provider.

use super::CryptoProvider;
use crate::error::{AeadError, CryptoError};

use aes_gcm::aead::generic_array::typenum::{U12, U24};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Payload as AeadPayload};
use aes_gcm::{aes::Aes256, AesGcm, KeyInit};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

type Aes256Gcm12 = AesGcm<Aes256, U12>;
type Aes256Gcm24 = AesGcm<Aes256, U24>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// The default provider, backed by the RustCrypto crates.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformCrypto;

impl PlatformCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for PlatformCrypto {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        // getrandom only fails when the OS entropy source is unavailable,
        // which is unrecoverable for a crypto client.
        getrandom::getrandom(&mut out).expect("os entropy source unavailable");
        out
    }

    fn generate_uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn sha256_hex(&self, data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn hkdf_sha256(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let salt = (!salt.is_empty()).then_some(salt);
        let hk = Hkdf::<Sha256>::new(salt, ikm);
        let mut out = vec![0u8; len];
        hk.expand(info, &mut out)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(out)
    }

    fn argon2id(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        memory_kib: u32,
        len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let params = argon2::Params::new(memory_kib, iterations, 1, Some(len))
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
        let mut out = vec![0u8; len];
        argon
            .hash_password_into(password, salt, &mut out)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(out)
    }

    fn pbkdf2_sha512(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if iterations == 0 {
            return Err(CryptoError::Kdf("zero iterations".into()));
        }
        let mut out = vec![0u8; len];
        pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out);
        Ok(out)
    }

    fn aes_gcm_encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = AeadPayload {
            msg: plaintext,
            aad,
        };
        match nonce.len() {
            12 => Aes256Gcm12::new_from_slice(key)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .encrypt(GenericArray::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Encoding("gcm seal".into())),
            24 => Aes256Gcm24::new_from_slice(key)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .encrypt(GenericArray::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Encoding("gcm seal".into())),
            _ => Err(CryptoError::InvalidNonceLength),
        }
    }

    fn aes_gcm_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let payload = AeadPayload {
            msg: ciphertext,
            aad,
        };
        match nonce.len() {
            12 => Aes256Gcm12::new_from_slice(key)
                .map_err(|_| AeadError)?
                .decrypt(GenericArray::from_slice(nonce), payload)
                .map_err(|_| AeadError),
            24 => Aes256Gcm24::new_from_slice(key)
                .map_err(|_| AeadError)?
                .decrypt(GenericArray::from_slice(nonce), payload)
                .map_err(|_| AeadError),
            _ => Err(AeadError),
        }
    }

    fn aes_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| AeadError)?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| AeadError)
    }

    fn hmac_sha256_hex(&self, key: &[u8], message: &[u8]) -> String {
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crypto() -> PlatformCrypto {
        PlatformCrypto::new()
    }

    #[test]
    fn random_bytes_are_distinct() {
        let a = crypto().random_bytes(32);
        let b = crypto().random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn gcm_roundtrip_with_24_byte_nonce() {
        let c = crypto();
        let key = c.random_bytes(32);
        let nonce = c.random_bytes(24);
        let aad = serde_json::to_vec(&json!({"foo": "bar"})).unwrap();

        let ct = c.aes_gcm_encrypt(&key, &nonce, b"hello world", &aad).unwrap();
        let pt = c.aes_gcm_decrypt(&key, &nonce, &ct, &aad).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn gcm_aad_mismatch_fails() {
        let c = crypto();
        let key = c.random_bytes(32);
        let nonce = c.random_bytes(24);
        let aad = serde_json::to_vec(&json!({"foo": "bar"})).unwrap();
        let wrong = serde_json::to_vec(&json!({"foo": "rab"})).unwrap();

        let ct = c.aes_gcm_encrypt(&key, &nonce, b"hello world", &aad).unwrap();
        assert_eq!(c.aes_gcm_decrypt(&key, &nonce, &ct, &wrong), Err(AeadError));
    }

    #[test]
    fn gcm_rejects_bad_nonce_length() {
        let c = crypto();
        let key = c.random_bytes(32);
        assert!(c.aes_gcm_encrypt(&key, &[0u8; 16], b"x", b"").is_err());
    }

    #[test]
    fn cbc_roundtrip() {
        let c = crypto();
        let key = c.random_bytes(32);
        let iv = c.random_bytes(16);
        let ct = c.aes_cbc_encrypt(&key, &iv, b"legacy data").unwrap();
        assert_eq!(c.aes_cbc_decrypt(&key, &iv, &ct).unwrap(), b"legacy data");
    }

    #[test]
    fn pbkdf2_is_deterministic() {
        let c = crypto();
        let a = c.pbkdf2_sha512(b"password", b"salt", 3000, 64).unwrap();
        let b = c.pbkdf2_sha512(b"password", b"salt", 3000, 64).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c.pbkdf2_sha512(b"password", b"tlas", 3000, 64).unwrap());
    }

    #[test]
    fn argon2id_output_length() {
        let c = crypto();
        let out = c.argon2id(b"password", &[7u8; 16], 1, 8, 64).unwrap();
        assert_eq!(out.len(), 64);
    }

    #[test]
    fn hkdf_expands() {
        let c = crypto();
        let out = c.hkdf_sha256(b"ikm", b"salt", b"info", 42).unwrap();
        assert_eq!(out.len(), 42);
    }

    #[test]
    fn hmac_hex_is_stable() {
        let c = crypto();
        assert_eq!(
            c.hmac_sha256_hex(b"k", b"m"),
            c.hmac_sha256_hex(b"k", b"m")
        );
    }
}
