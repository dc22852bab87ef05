//! Cryptographic primitives for both wire protocols.
//!
//! Stateless helpers: RSA-1024 key generation and public-key encryption with
//! an OAEP-to-PKCS#1-v1.5 fallback (older firmware only accepts the legacy
//! padding), AES-128-CBC with PKCS#7 padding, SHA-1/SHA-256 digests, random
//! bytes, and base64. Key material never appears in error values.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::LineEnding;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const RSA_BITS: usize = 1024;

/// Errors produced by the primitive layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa key generation failed")]
    KeyGeneration,
    #[error("rsa public key is not valid PKCS#1 PEM")]
    InvalidPublicKey,
    #[error("pem encoding failed")]
    PemEncoding,
    #[error("rsa encryption failed under both padding schemes")]
    RsaEncrypt,
    #[error("rsa decryption failed under both padding schemes")]
    RsaDecrypt,
    #[error("{name} must be exactly {expected} bytes, got {actual}")]
    KeyLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("aes padding validation failed")]
    Padding,
    #[error("base64 decode failed")]
    Base64,
}

/// Freshly generated RSA-1024 key pair, PEM-encodable as PKCS#1.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// PKCS#1 PEM of the public key, as sent in the handshake request.
    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|_| CryptoError::PemEncoding)
    }

    pub fn private_pem(&self) -> Result<String, CryptoError> {
        self.private
            .to_pkcs1_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|_| CryptoError::PemEncoding)
    }
}

pub fn generate_rsa_keypair() -> Result<RsaKeyPair, CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|_| CryptoError::KeyGeneration)?;
    let public = RsaPublicKey::from(&private);
    Ok(RsaKeyPair { private, public })
}

pub fn rsa_public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Encrypts with OAEP(SHA-1) first and retries with PKCS#1 v1.5 when the
/// modulus cannot carry the OAEP overhead. Returns base64 ciphertext.
pub fn rsa_encrypt(data: &[u8], public: &RsaPublicKey) -> Result<String, CryptoError> {
    let ciphertext = public
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), data)
        .or_else(|_| public.encrypt(&mut OsRng, Pkcs1v15Encrypt, data))
        .map_err(|_| CryptoError::RsaEncrypt)?;
    Ok(BASE64.encode(ciphertext))
}

/// Decrypts base64 ciphertext, mirroring the padding fallback of
/// [`rsa_encrypt`].
pub fn rsa_decrypt(data_b64: &str, private: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = base64_decode(data_b64)?;
    private
        .decrypt(Oaep::new::<Sha1>(), &ciphertext)
        .or_else(|_| private.decrypt(Pkcs1v15Encrypt, &ciphertext))
        .map_err(|_| CryptoError::RsaDecrypt)
}

fn check_16(name: &'static str, bytes: &[u8]) -> Result<[u8; 16], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::KeyLength {
        name,
        expected: 16,
        actual: bytes.len(),
    })
}

/// AES-128-CBC encryption with PKCS#7 padding.
pub fn aes_cbc_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = check_16("aes key", key)?;
    let iv = check_16("aes iv", iv)?;
    let encryptor = Aes128CbcEnc::new(&key.into(), &iv.into());
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-128-CBC decryption with PKCS#7 padding validation.
pub fn aes_cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = check_16("aes key", key)?;
    let iv = check_16("aes iv", iv)?;
    let decryptor = Aes128CbcDec::new(&key.into(), &iv.into());
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Padding)
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex of the SHA-1 digest, as used in the passthrough login.
pub fn sha1_hex(data: &[u8]) -> String {
    sha1(data).iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn base64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(data.trim()).map_err(|_| CryptoError::Base64)
}
