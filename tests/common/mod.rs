#![allow(dead_code)]
//! In-memory mock of a Tapo endpoint speaking both wire protocols.
//!
//! Implements the server half of the KLAP and passthrough exchanges over
//! the `Transport` seam, with a scriptable device model behind it. Tests
//! inspect the wire log (paths, sequence numbers, raw frames, timestamps)
//! to check framing and scheduling invariants.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use tapo::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, base64_decode, base64_encode, random_bytes,
    rsa_encrypt, rsa_public_key_from_pem, sha1_hex,
};
use tapo::protocol::klap::{auth_hash, client_proof, server_proof, KlapKeys};
use tapo::transport::{HttpResponse, Transport};
use tapo::{Credentials, TapoError};

pub const KLAP_COOKIE: &str = "TP_SESSIONID=MOCK-KLAP";
pub const PASSTHROUGH_COOKIE: &str = "TP_SESSIONID=MOCK-PT";
pub const TOKEN: &str = "MOCKTOKEN";

const PT_KEY: [u8; 16] = [7u8; 16];
const PT_IV: [u8; 16] = [9u8; 16];

/// One observed HTTP exchange.
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub path: String,
    pub query: Option<String>,
    pub body: Vec<u8>,
    pub at: Instant,
}

/// Scriptable device model shared by both protocol front-ends.
pub struct DeviceState {
    pub model: String,
    pub device_on: bool,
    pub brightness: u8,
    pub hue: u16,
    pub saturation: u8,
    pub color_temp: u16,
    pub nickname: String,
    pub current_power: f64,
    pub busy_before_success: u32,
    pub children: Vec<(String, bool)>,
    pub calls: Vec<String>,
}

impl DeviceState {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            device_on: false,
            brightness: 50,
            hue: 0,
            saturation: 0,
            color_temp: 2700,
            nickname: "Mock device".to_string(),
            current_power: 12.5,
            busy_before_success: 0,
            children: vec![("outlet-1".into(), false), ("outlet-2".into(), true)],
            calls: Vec::new(),
        }
    }
}

struct KlapServerSide {
    local_seed: Vec<u8>,
    remote_seed: Vec<u8>,
    keys: Option<KlapKeys>,
    last_seq: Option<i32>,
}

struct PassthroughServerSide {
    logged_in: bool,
}

pub struct MockServer {
    pub credentials: Credentials,
    pub klap_enabled: bool,
    pub passthrough_enabled: bool,
    pub tamper_server_hash: bool,
    /// When false, `login_device` only accepts `base64(email)` usernames.
    pub accept_hashed_username: bool,
    pub state: Mutex<DeviceState>,
    klap: Mutex<Option<KlapServerSide>>,
    passthrough: Mutex<Option<PassthroughServerSide>>,
    pub wire_log: Mutex<Vec<WireRecord>>,
}

impl MockServer {
    pub fn new(credentials: Credentials, model: &str) -> Arc<Self> {
        Arc::new(Self {
            credentials,
            klap_enabled: true,
            passthrough_enabled: true,
            tamper_server_hash: false,
            accept_hashed_username: true,
            state: Mutex::new(DeviceState::new(model)),
            klap: Mutex::new(None),
            passthrough: Mutex::new(None),
            wire_log: Mutex::new(Vec::new()),
        })
    }

    pub fn builder(credentials: Credentials, model: &str) -> MockServerBuilder {
        MockServerBuilder {
            server: Self::new(credentials, model),
        }
    }

    /// Server-side KLAP key material, for frame-level assertions.
    pub fn klap_keys(&self) -> Option<KlapKeys> {
        self.klap.lock().as_ref().and_then(|side| side.keys.clone())
    }

    /// Simulates the device forgetting the KLAP session (reboot, eviction);
    /// the next request is answered with 403.
    pub fn drop_klap_session(&self) {
        *self.klap.lock() = None;
    }

    pub fn records(&self, path: &str) -> Vec<WireRecord> {
        self.wire_log
            .lock()
            .iter()
            .filter(|record| record.path == path)
            .cloned()
            .collect()
    }

    pub fn dispatched_methods(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn log(&self, path: &str, query: Option<&str>, body: &[u8]) {
        self.wire_log.lock().push(WireRecord {
            path: path.to_string(),
            query: query.map(str::to_string),
            body: body.to_vec(),
            at: Instant::now(),
        });
    }

    fn response(status: u16, body: Vec<u8>, cookie: Option<&str>) -> HttpResponse {
        HttpResponse {
            status,
            body,
            cookie: cookie.map(str::to_string),
        }
    }

    /// Applies one decrypted inner request to the device model.
    fn handle_inner(&self, inner: &Value) -> Value {
        let method = inner.get("method").and_then(Value::as_str).unwrap_or("");
        let params = inner.get("params").cloned().unwrap_or_else(|| json!({}));
        let mut state = self.state.lock();
        state.calls.push(method.to_string());

        if state.busy_before_success > 0 {
            state.busy_before_success -= 1;
            return json!({"error_code": -1012});
        }

        match method {
            "get_device_info" => {
                let result = json!({
                    "device_id": "802D-MOCK",
                    "model": state.model,
                    "type": "SMART.TAPO",
                    "fw_ver": "1.2.3",
                    "hw_ver": "1.0",
                    "mac": "DE-AD-BE-EF-00-01",
                    "nickname": base64_encode(state.nickname.as_bytes()),
                    "device_on": state.device_on,
                    "on_time": 321,
                    "overheated": false,
                    "rssi": -44,
                    "signal_level": 3,
                    "brightness": state.brightness,
                    "hue": state.hue,
                    "saturation": state.saturation,
                    "color_temp": state.color_temp,
                });
                json!({"error_code": 0, "result": result})
            }
            "set_device_info" => {
                if let Some(on) = params.get("device_on").and_then(Value::as_bool) {
                    state.device_on = on;
                }
                if let Some(brightness) = params.get("brightness").and_then(Value::as_u64) {
                    state.brightness = brightness as u8;
                }
                if let Some(hue) = params.get("hue").and_then(Value::as_u64) {
                    state.hue = hue as u16;
                }
                if let Some(saturation) = params.get("saturation").and_then(Value::as_u64) {
                    state.saturation = saturation as u8;
                }
                if let Some(color_temp) = params.get("color_temp").and_then(Value::as_u64) {
                    state.color_temp = color_temp as u16;
                }
                if let Some(nickname) = params.get("nickname").and_then(Value::as_str) {
                    if let Ok(bytes) = base64_decode(nickname) {
                        state.nickname = String::from_utf8_lossy(&bytes).into_owned();
                    }
                }
                // Set-calls answer with a bare success envelope.
                json!({"error_code": 0})
            }
            "set_lighting_effect" => json!({"error_code": 0}),
            "get_current_power" => json!({
                "error_code": 0,
                "result": {"current_power": state.current_power},
            }),
            "get_energy_usage" => json!({
                "error_code": 0,
                "result": {
                    "today_runtime": 120,
                    "month_runtime": 4200,
                    "today_energy": 760,
                    "month_energy": 15300,
                    "current_power": state.current_power,
                },
            }),
            "get_energy_data" => {
                let start = params
                    .get("start_timestamp")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let interval = params.get("interval").and_then(Value::as_u64).unwrap_or(60);
                json!({
                    "error_code": 0,
                    "result": {
                        "start_timestamp": start,
                        "end_timestamp": start + interval * 60,
                        "interval": interval,
                        "data": [5, 8, 13, 21],
                        "local_time": "2024-06-01 12:00:00",
                    },
                })
            }
            "get_child_device_list" => {
                let children: Vec<Value> = state
                    .children
                    .iter()
                    .enumerate()
                    .map(|(position, (id, on))| {
                        json!({
                            "device_id": id,
                            "nickname": base64_encode(format!("Outlet {position}").as_bytes()),
                            "device_on": on,
                            "position": position as u32 + 1,
                        })
                    })
                    .collect();
                json!({"error_code": 0, "result": {"child_device_list": children}})
            }
            "set_child_device_info" => {
                let id = params.get("device_id").and_then(Value::as_str).unwrap_or("");
                let on = params
                    .get("device_on")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match state.children.iter_mut().find(|(cid, _)| cid == id) {
                    Some(child) => {
                        child.1 = on;
                        json!({"error_code": 0})
                    }
                    None => json!({"error_code": -1003}),
                }
            }
            _ => json!({"error_code": -1003}),
        }
    }

    fn handle_klap_handshake1(&self, body: &[u8]) -> HttpResponse {
        if !self.klap_enabled {
            return Self::response(404, Vec::new(), None);
        }
        let remote_seed = random_bytes(16);
        let auth = auth_hash(&self.credentials);
        let mut proof = server_proof(body, &remote_seed, &auth);
        if self.tamper_server_hash {
            proof[0] ^= 0xff;
        }
        let mut payload = Vec::with_capacity(48);
        payload.extend_from_slice(&remote_seed);
        payload.extend_from_slice(&proof);
        *self.klap.lock() = Some(KlapServerSide {
            local_seed: body.to_vec(),
            remote_seed,
            keys: None,
            last_seq: None,
        });
        Self::response(200, payload, Some(KLAP_COOKIE))
    }

    fn handle_klap_handshake2(&self, body: &[u8], cookie: Option<&str>) -> HttpResponse {
        if cookie != Some(KLAP_COOKIE) {
            return Self::response(403, Vec::new(), None);
        }
        let mut guard = self.klap.lock();
        let Some(side) = guard.as_mut() else {
            return Self::response(403, Vec::new(), None);
        };
        let auth = auth_hash(&self.credentials);
        let expected = client_proof(&side.local_seed, &side.remote_seed, &auth);
        if body != expected {
            return Self::response(403, Vec::new(), None);
        }
        side.keys = Some(KlapKeys::derive(&side.local_seed, &side.remote_seed, &auth));
        Self::response(200, Vec::new(), None)
    }

    fn handle_klap_request(&self, query: Option<&str>, body: &[u8]) -> HttpResponse {
        let seq: i32 = match query
            .and_then(|q| q.strip_prefix("seq="))
            .and_then(|v| v.parse().ok())
        {
            Some(seq) => seq,
            None => return Self::response(400, Vec::new(), None),
        };
        let mut guard = self.klap.lock();
        let Some(side) = guard.as_mut() else {
            return Self::response(403, Vec::new(), None);
        };
        let Some(keys) = side.keys.clone() else {
            return Self::response(403, Vec::new(), None);
        };
        if body.len() < 48 || body[..32] != keys.sign(seq, &body[32..]) {
            return Self::response(403, Vec::new(), None);
        }
        if let Some(last) = side.last_seq {
            if seq != last.wrapping_add(1) {
                return Self::response(403, Vec::new(), None);
            }
        }
        side.last_seq = Some(seq);

        let plaintext = match keys.open(seq, body) {
            Ok(plaintext) => plaintext,
            Err(_) => return Self::response(403, Vec::new(), None),
        };
        let inner: Value = match serde_json::from_slice(&plaintext) {
            Ok(inner) => inner,
            Err(_) => return Self::response(400, Vec::new(), None),
        };
        drop(guard);

        let envelope = self.handle_inner(&inner);
        let bytes = serde_json::to_vec(&envelope).expect("envelope serializes");
        let guard = self.klap.lock();
        let keys = guard
            .as_ref()
            .and_then(|side| side.keys.clone())
            .expect("klap session established");
        let frame = keys.seal(seq, &bytes).expect("seal response");
        Self::response(200, frame, None)
    }

    fn handle_passthrough(&self, query: Option<&str>, body: &Value) -> HttpResponse {
        let method = body.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            "handshake" => {
                if !self.passthrough_enabled {
                    return Self::response(404, Vec::new(), None);
                }
                let Some(pem) = body.pointer("/params/key").and_then(Value::as_str) else {
                    return Self::response(400, Vec::new(), None);
                };
                let Ok(public) = rsa_public_key_from_pem(pem) else {
                    return Self::response(400, Vec::new(), None);
                };
                let mut secret = Vec::with_capacity(32);
                secret.extend_from_slice(&PT_KEY);
                secret.extend_from_slice(&PT_IV);
                let encrypted = rsa_encrypt(&secret, &public).expect("server-side rsa");
                *self.passthrough.lock() = Some(PassthroughServerSide { logged_in: false });
                let envelope = json!({"error_code": 0, "result": {"key": encrypted}});
                Self::response(
                    200,
                    serde_json::to_vec(&envelope).unwrap(),
                    Some(PASSTHROUGH_COOKIE),
                )
            }
            "securePassthrough" => {
                let Some(request_b64) = body.pointer("/params/request").and_then(Value::as_str)
                else {
                    return Self::response(400, Vec::new(), None);
                };
                let Ok(ciphertext) = base64_decode(request_b64) else {
                    return Self::response(400, Vec::new(), None);
                };
                let Ok(plaintext) = aes_cbc_decrypt(&ciphertext, &PT_KEY, &PT_IV) else {
                    return Self::response(400, Vec::new(), None);
                };
                let Ok(inner) = serde_json::from_slice::<Value>(&plaintext) else {
                    return Self::response(400, Vec::new(), None);
                };

                let inner_method = inner.get("method").and_then(Value::as_str).unwrap_or("");
                let token_query = format!("token={TOKEN}");
                let authorized = query == Some(token_query.as_str())
                    && self
                        .passthrough
                        .lock()
                        .as_ref()
                        .map(|side| side.logged_in)
                        .unwrap_or(false);
                let envelope = if inner_method == "login_device" {
                    self.handle_login(&inner)
                } else if !authorized {
                    json!({"error_code": -1001})
                } else {
                    self.handle_inner(&inner)
                };

                let bytes = serde_json::to_vec(&envelope).unwrap();
                let encrypted = aes_cbc_encrypt(&bytes, &PT_KEY, &PT_IV).expect("encrypt");
                let outer = json!({
                    "error_code": 0,
                    "result": {"response": base64_encode(&encrypted)},
                });
                Self::response(200, serde_json::to_vec(&outer).unwrap(), None)
            }
            _ => Self::response(400, Vec::new(), None),
        }
    }

    fn handle_login(&self, inner: &Value) -> Value {
        let username = inner
            .pointer("/params/username")
            .and_then(Value::as_str)
            .unwrap_or("");
        let password = inner
            .pointer("/params/password")
            .and_then(Value::as_str)
            .unwrap_or("");

        let hashed = base64_encode(sha1_hex(self.credentials.username().as_bytes()).as_bytes());
        let plain = base64_encode(self.credentials.username().as_bytes());
        let username_ok = (self.accept_hashed_username && username == hashed) || username == plain;
        let password_ok = password == base64_encode(self.credentials.password().as_bytes());

        if username_ok && password_ok {
            if let Some(side) = self.passthrough.lock().as_mut() {
                side.logged_in = true;
            }
            json!({"error_code": 0, "result": {"token": TOKEN}})
        } else {
            json!({"error_code": -1501})
        }
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn post_json(
        &self,
        path: &str,
        query: Option<&str>,
        body: &Value,
        _cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, TapoError> {
        let bytes = serde_json::to_vec(body).unwrap();
        self.log(path, query, &bytes);
        if !path.is_empty() {
            return Ok(Self::response(404, Vec::new(), None));
        }
        Ok(self.handle_passthrough(query, body))
    }

    async fn post_raw(
        &self,
        path: &str,
        query: Option<&str>,
        body: Vec<u8>,
        cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, TapoError> {
        self.log(path, query, &body);
        Ok(match path {
            "handshake1" => self.handle_klap_handshake1(&body),
            "handshake2" => self.handle_klap_handshake2(&body, cookie),
            "request" => self.handle_klap_request(query, &body),
            _ => Self::response(404, Vec::new(), None),
        })
    }
}

/// Fluent construction for the common test setups.
pub struct MockServerBuilder {
    server: Arc<MockServer>,
}

impl MockServerBuilder {
    fn server_mut(&mut self) -> &mut MockServer {
        Arc::get_mut(&mut self.server).expect("builder holds the only reference")
    }

    pub fn klap_disabled(mut self) -> Self {
        self.server_mut().klap_enabled = false;
        self
    }

    pub fn passthrough_disabled(mut self) -> Self {
        self.server_mut().passthrough_enabled = false;
        self
    }

    pub fn tampered_server_hash(mut self) -> Self {
        self.server_mut().tamper_server_hash = true;
        self
    }

    pub fn reject_hashed_username(mut self) -> Self {
        self.server_mut().accept_hashed_username = false;
        self
    }

    pub fn build(self) -> Arc<MockServer> {
        self.server
    }
}

pub fn test_credentials() -> Credentials {
    Credentials::new("a@b.c", "pw")
}
