//! Legacy passthrough protocol: RSA key exchange, then AES-encrypted JSON
//! wrapped in a `securePassthrough` envelope over plain HTTP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{check_error_code, extract_result, TapoRequest};
use crate::config::{Credentials, TapoConfig};
use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, base64_decode, base64_encode, generate_rsa_keypair,
    rsa_decrypt, sha1_hex,
};
use crate::error::TapoError;
use crate::transport::Transport;

/// Builds `login_device` parameters.
///
/// Older firmware expects `base64(sha1_hex(email))`, newer firmware
/// `base64(email)`; the session tries the hashed form first and falls back
/// on credential rejection.
fn login_params(credentials: &Credentials, hashed_username: bool) -> Value {
    let username = if hashed_username {
        base64_encode(sha1_hex(credentials.username().as_bytes()).as_bytes())
    } else {
        base64_encode(credentials.username().as_bytes())
    };
    json!({
        "username": username,
        "password": base64_encode(credentials.password().as_bytes()),
    })
}

/// An authenticated passthrough session bound to one device.
pub struct PassthroughSession<T: Transport> {
    transport: Arc<T>,
    cookie: String,
    key: [u8; 16],
    iv: [u8; 16],
    token: Option<String>,
    terminal_uuid: String,
    expires_at: Instant,
    request_timeout: Duration,
}

impl<T: Transport> PassthroughSession<T> {
    /// Runs the RSA handshake and the credential login.
    ///
    /// # Errors
    /// Returns `ProtocolUnsupported` when the device rejects the handshake
    /// envelope and `Auth` when both username forms are refused.
    pub async fn handshake(
        transport: Arc<T>,
        credentials: &Credentials,
        config: &TapoConfig,
    ) -> Result<Self, TapoError> {
        let pair = generate_rsa_keypair()?;
        let body = json!({
            "method": "handshake",
            "params": {"key": pair.public_pem()?},
        });
        let response = transport
            .post_json("", None, &body, None, config.handshake_timeout)
            .await?;
        if response.status != 200 {
            return Err(TapoError::ProtocolUnsupported(format!(
                "passthrough handshake rejected (status {})",
                response.status
            )));
        }
        let cookie = response.cookie.clone().ok_or_else(|| {
            TapoError::Session("passthrough handshake response carried no session cookie".into())
        })?;
        let envelope = response.json().map_err(|_| {
            TapoError::ProtocolUnsupported("passthrough handshake answered with non-JSON".into())
        })?;
        let code = envelope
            .get("error_code")
            .and_then(Value::as_i64)
            .unwrap_or(-1) as i32;
        if code != 0 {
            return Err(TapoError::ProtocolUnsupported(format!(
                "passthrough handshake rejected (code {code})"
            )));
        }
        let key_b64 = envelope
            .pointer("/result/key")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TapoError::ProtocolUnsupported("passthrough handshake result missing key".into())
            })?;

        let secret = rsa_decrypt(key_b64, pair.private_key())?;
        if secret.len() < 32 {
            return Err(TapoError::Session(format!(
                "passthrough handshake secret has {} bytes, expected 32",
                secret.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&secret[..16]);
        iv.copy_from_slice(&secret[16..32]);
        debug!("passthrough handshake complete");

        let mut session = Self {
            transport,
            cookie,
            key,
            iv,
            token: None,
            terminal_uuid: Uuid::new_v4().to_string(),
            expires_at: Instant::now() + config.session_lifetime,
            request_timeout: config.connection_timeout,
        };
        session.login(credentials).await?;
        Ok(session)
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<(), TapoError> {
        match self.login_attempt(login_params(credentials, true)).await {
            Ok(token) => {
                self.token = Some(token);
                Ok(())
            }
            Err(TapoError::Auth(_)) => {
                let token = self.login_attempt(login_params(credentials, false)).await?;
                self.token = Some(token);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn login_attempt(&self, params: Value) -> Result<String, TapoError> {
        let result = self.roundtrip("login_device", params).await?;
        result
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TapoError::Session("login response carried no token".into()))
    }

    /// Encrypts one inner request, posts the `securePassthrough` envelope,
    /// and decrypts the inner response.
    async fn roundtrip(&self, method: &str, params: Value) -> Result<Value, TapoError> {
        let inner = TapoRequest::new(method, params, Some(self.terminal_uuid.clone()));
        let plaintext = serde_json::to_vec(&inner)
            .map_err(|err| TapoError::InvalidRequest(format!("unserializable params: {err}")))?;
        let encrypted = aes_cbc_encrypt(&plaintext, &self.key, &self.iv)?;
        let outer = json!({
            "method": "securePassthrough",
            "params": {"request": base64_encode(&encrypted)},
        });
        let query = self.token.as_ref().map(|token| format!("token={token}"));

        let response = self
            .transport
            .post_json(
                "",
                query.as_deref(),
                &outer,
                Some(&self.cookie),
                self.request_timeout,
            )
            .await?;
        if response.status != 200 {
            return Err(TapoError::Session(format!(
                "passthrough request rejected (status {})",
                response.status
            )));
        }
        let envelope = response.json()?;
        let code = envelope
            .get("error_code")
            .and_then(Value::as_i64)
            .unwrap_or(-1) as i32;
        check_error_code(code)?;

        let inner_b64 = envelope
            .pointer("/result/response")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TapoError::Session("passthrough envelope carried no inner response".into())
            })?;
        let ciphertext = base64_decode(inner_b64)?;
        let plaintext = aes_cbc_decrypt(&ciphertext, &self.key, &self.iv)?;
        let inner_envelope: Value = serde_json::from_slice(&plaintext).map_err(|_| {
            TapoError::Session(format!(
                "passthrough response decrypted to non-JSON ({} bytes)",
                plaintext.len()
            ))
        })?;
        extract_result(inner_envelope)
    }

    pub async fn execute(&mut self, method: &str, params: Value) -> Result<Value, TapoError> {
        if self.token.is_none() {
            return Err(TapoError::Session(
                "passthrough session has no auth token".into(),
            ));
        }
        self.roundtrip(method, params).await
    }
}
