//! KLAP: binary two-round seed handshake, then signed and sequence-numbered
//! encrypted frames.
//!
//! Both sides prove possession of the credentials by mixing an auth hash
//! (`sha256(sha1(email) ∥ sha1(password))`) into each handshake digest.
//! Session state (AES key, IV prefix, signing key, initial sequence) is
//! derived from the two seeds with domain-separated SHA-256.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

use super::{extract_result, TapoRequest};
use crate::config::{Credentials, TapoConfig};
use crate::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, random_bytes, sha1, sha256};
use crate::error::TapoError;
use crate::transport::Transport;

const SEED_LEN: usize = 16;
const HANDSHAKE1_BODY_LEN: usize = 48;
const SIGNATURE_LEN: usize = 32;
/// Devices answer -1012 when queried immediately after handshake2.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// `sha256(sha1(email) ∥ sha1(password))`.
pub fn auth_hash(credentials: &Credentials) -> [u8; 32] {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&sha1(credentials.username().as_bytes()));
    buf.extend_from_slice(&sha1(credentials.password().as_bytes()));
    sha256(&buf)
}

/// Digest the server must echo in handshake1: `sha256(local ∥ remote ∥ auth)`.
pub fn server_proof(local_seed: &[u8], remote_seed: &[u8], auth: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(local_seed.len() + remote_seed.len() + 32);
    buf.extend_from_slice(local_seed);
    buf.extend_from_slice(remote_seed);
    buf.extend_from_slice(auth);
    sha256(&buf)
}

/// Digest the client sends in handshake2: `sha256(remote ∥ local ∥ auth)`.
pub fn client_proof(local_seed: &[u8], remote_seed: &[u8], auth: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(local_seed.len() + remote_seed.len() + 32);
    buf.extend_from_slice(remote_seed);
    buf.extend_from_slice(local_seed);
    buf.extend_from_slice(auth);
    sha256(&buf)
}

fn tagged_digest(tag: &[u8], local: &[u8], remote: &[u8], auth: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(tag.len() + local.len() + remote.len() + 32);
    buf.extend_from_slice(tag);
    buf.extend_from_slice(local);
    buf.extend_from_slice(remote);
    buf.extend_from_slice(auth);
    sha256(&buf)
}

/// Symmetric state derived from the handshake seeds.
#[derive(Debug, Clone)]
pub struct KlapKeys {
    key: [u8; 16],
    iv_prefix: [u8; 12],
    signature_key: [u8; 28],
    initial_seq: i32,
}

impl KlapKeys {
    pub fn derive(local_seed: &[u8], remote_seed: &[u8], auth: &[u8; 32]) -> Self {
        let key_digest = tagged_digest(b"lsk", local_seed, remote_seed, auth);
        let iv_digest = tagged_digest(b"iv", local_seed, remote_seed, auth);
        let sig_digest = tagged_digest(b"ldk", local_seed, remote_seed, auth);

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_digest[..16]);
        let mut iv_prefix = [0u8; 12];
        iv_prefix.copy_from_slice(&iv_digest[..12]);
        let mut signature_key = [0u8; 28];
        signature_key.copy_from_slice(&sig_digest[..28]);
        let initial_seq = i32::from_be_bytes(iv_digest[28..32].try_into().unwrap());

        Self {
            key,
            iv_prefix,
            signature_key,
            initial_seq,
        }
    }

    /// Sequence counter value seeded by the tail of the IV digest.
    pub fn initial_seq(&self) -> i32 {
        self.initial_seq
    }

    pub fn signature_key(&self) -> &[u8; 28] {
        &self.signature_key
    }

    pub fn iv_for(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_prefix);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// `sha256(signature_key ∥ seq_be32 ∥ ciphertext)`.
    pub fn sign(&self, seq: i32, ciphertext: &[u8]) -> [u8; 32] {
        let mut buf = Vec::with_capacity(28 + 4 + ciphertext.len());
        buf.extend_from_slice(&self.signature_key);
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(ciphertext);
        sha256(&buf)
    }

    /// Produces a wire frame: `signature(32) ∥ ciphertext`.
    pub fn seal(&self, seq: i32, plaintext: &[u8]) -> Result<Vec<u8>, TapoError> {
        let ciphertext = aes_cbc_encrypt(plaintext, &self.key, &self.iv_for(seq))?;
        let signature = self.sign(seq, &ciphertext);
        let mut frame = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        frame.extend_from_slice(&signature);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Splits and decrypts a wire frame of the same layout.
    pub fn open(&self, seq: i32, frame: &[u8]) -> Result<Vec<u8>, TapoError> {
        if frame.len() < SIGNATURE_LEN + 16 || (frame.len() - SIGNATURE_LEN) % 16 != 0 {
            return Err(TapoError::Session(format!(
                "klap frame has invalid length {}",
                frame.len()
            )));
        }
        let plaintext = aes_cbc_decrypt(&frame[SIGNATURE_LEN..], &self.key, &self.iv_for(seq))?;
        Ok(plaintext)
    }
}

/// An authenticated KLAP session bound to one device.
pub struct KlapSession<T: Transport> {
    transport: Arc<T>,
    cookie: String,
    terminal_uuid: String,
    keys: KlapKeys,
    seq: i32,
    expires_at: Instant,
    request_timeout: Duration,
}

impl<T: Transport> KlapSession<T> {
    /// Runs both handshake rounds and derives the session state.
    ///
    /// # Errors
    /// Returns `ProtocolUnsupported` when the KLAP endpoints are absent or
    /// answer with an unexpected shape, and `Auth` when the server's seed
    /// proof does not match the local credentials.
    pub async fn handshake(
        transport: Arc<T>,
        credentials: &Credentials,
        config: &TapoConfig,
    ) -> Result<Self, TapoError> {
        let local_seed = random_bytes(SEED_LEN);
        let response = transport
            .post_raw(
                "handshake1",
                None,
                local_seed.clone(),
                None,
                config.handshake_timeout,
            )
            .await?;
        if response.status != 200 {
            return Err(TapoError::ProtocolUnsupported(format!(
                "klap handshake1 rejected (status {})",
                response.status
            )));
        }
        if response.body.len() != HANDSHAKE1_BODY_LEN {
            return Err(TapoError::ProtocolUnsupported(format!(
                "klap handshake1 body has {} bytes, expected {}",
                response.body.len(),
                HANDSHAKE1_BODY_LEN
            )));
        }
        let cookie = response.cookie.ok_or_else(|| {
            TapoError::Session("klap handshake1 response carried no session cookie".into())
        })?;

        let auth = auth_hash(credentials);
        let remote_seed = &response.body[..SEED_LEN];
        let server_hash = &response.body[SEED_LEN..];
        let expected = server_proof(&local_seed, remote_seed, &auth);
        if expected != server_hash {
            return Err(TapoError::Auth("Email or password incorrect".into()));
        }

        let confirm = client_proof(&local_seed, remote_seed, &auth);
        let response = transport
            .post_raw(
                "handshake2",
                None,
                confirm.to_vec(),
                Some(&cookie),
                config.handshake_timeout,
            )
            .await?;
        if response.status != 200 {
            return Err(TapoError::ProtocolUnsupported(format!(
                "klap handshake2 rejected (status {})",
                response.status
            )));
        }

        let keys = KlapKeys::derive(&local_seed, remote_seed, &auth);
        let seq = keys.initial_seq();
        debug!(initial_seq = seq, "klap handshake complete");
        sleep(SETTLE_DELAY).await;

        Ok(Self {
            transport,
            cookie,
            terminal_uuid: Uuid::new_v4().to_string(),
            keys,
            seq,
            expires_at: Instant::now() + config.session_lifetime,
            request_timeout: config.connection_timeout,
        })
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Current sequence counter; advances by exactly one per transmission.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub async fn execute(&mut self, method: &str, params: Value) -> Result<Value, TapoError> {
        let next = self.seq.wrapping_add(1);
        if next == self.keys.initial_seq() {
            // Counter wrapped all the way around; a fresh handshake is the
            // only safe continuation.
            return Err(TapoError::SessionExpired);
        }
        self.seq = next;

        let request = TapoRequest::new(method, params, Some(self.terminal_uuid.clone()));
        let plaintext = serde_json::to_vec(&request)
            .map_err(|err| TapoError::InvalidRequest(format!("unserializable params: {err}")))?;
        let frame = self.keys.seal(self.seq, &plaintext)?;
        let query = format!("seq={}", self.seq);

        let response = self
            .transport
            .post_raw(
                "request",
                Some(&query),
                frame,
                Some(&self.cookie),
                self.request_timeout,
            )
            .await?;
        match response.status {
            200 => {}
            403 => return Err(TapoError::SessionExpired),
            status => {
                return Err(TapoError::Session(format!(
                    "klap request rejected (status {status})"
                )))
            }
        }

        let plaintext = self.keys.open(self.seq, &response.body)?;
        let envelope: Value = serde_json::from_slice(&plaintext).map_err(|_| {
            TapoError::Session(format!(
                "klap response decrypted to non-JSON ({} bytes)",
                plaintext.len()
            ))
        })?;
        extract_result(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_keys() -> KlapKeys {
        let credentials = Credentials::new("a@b.c", "pw");
        let auth = auth_hash(&credentials);
        KlapKeys::derive(&[0u8; 16], &[1u8; 16], &auth)
    }

    #[test]
    fn initial_seq_comes_from_iv_digest_tail() {
        let credentials = Credentials::new("a@b.c", "pw");
        let auth = auth_hash(&credentials);
        let local = [0u8; 16];
        let remote = [1u8; 16];
        let keys = KlapKeys::derive(&local, &remote, &auth);

        let iv_digest = tagged_digest(b"iv", &local, &remote, &auth);
        let expected = i32::from_be_bytes(iv_digest[28..32].try_into().unwrap());
        assert_eq!(keys.initial_seq(), expected);
    }

    #[test]
    fn per_request_iv_splices_sequence() {
        let keys = test_keys();
        let iv = keys.iv_for(-559038737); // 0xDEADBEEF as i32
        assert_eq!(&iv[12..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(iv[..12], keys.iv_prefix);
    }

    #[test]
    fn seal_produces_signature_then_ciphertext() {
        let keys = test_keys();
        let frame = keys.seal(7, b"{\"method\":\"get_device_info\"}").unwrap();
        assert!(frame.len() > SIGNATURE_LEN);
        assert_eq!((frame.len() - SIGNATURE_LEN) % 16, 0);
        let expected = keys.sign(7, &frame[SIGNATURE_LEN..]);
        assert_eq!(&frame[..SIGNATURE_LEN], expected);
    }

    #[test]
    fn seal_open_round_trip() {
        let keys = test_keys();
        let payload = json!({"method": "set_device_info", "params": {"device_on": false}});
        let bytes = serde_json::to_vec(&payload).unwrap();
        let frame = keys.seal(42, &bytes).unwrap();
        assert_eq!(keys.open(42, &frame).unwrap(), bytes);
    }

    #[test]
    fn open_rejects_truncated_frames() {
        let keys = test_keys();
        assert!(matches!(
            keys.open(1, &[0u8; 40]),
            Err(TapoError::Session(_))
        ));
    }

    #[test]
    fn open_with_wrong_seq_fails_padding() {
        let keys = test_keys();
        let frame = keys.seal(5, b"sixteen byte msg").unwrap();
        // Decrypting under a different sequence uses a different IV; the
        // plaintext either unpads wrong or differs. Both invalidate.
        match keys.open(6, &frame) {
            Ok(plain) => assert_ne!(plain, b"sixteen byte msg"),
            Err(err) => assert!(matches!(err, TapoError::Crypto(_))),
        }
    }

    #[test]
    fn proofs_are_direction_sensitive() {
        let credentials = Credentials::new("a@b.c", "pw");
        let auth = auth_hash(&credentials);
        let local = [2u8; 16];
        let remote = [9u8; 16];
        assert_ne!(
            server_proof(&local, &remote, &auth),
            client_proof(&local, &remote, &auth)
        );
    }
}
