//! LAN client for TP-Link Tapo smart-home devices.
//!
//! Implements both on-wire protocols (KLAP and secure passthrough) over
//! plain HTTP, with health-based protocol fallback, session lifecycle
//! management, a serialized request pipeline, and a capability-gated
//! device facade. All payloads are JSON, encrypted with per-session AES
//! state negotiated through the protocol handshakes.

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod session;
pub mod transport;

pub use config::{Credentials, TapoConfig};
pub use device::{
    Capabilities, ChildDevice, CurrentPower, Device, DeviceAddress, DeviceFamily, DeviceInfo,
    EnergyData, EnergyInterval, EnergyUsage, LightingEffect,
};
pub use error::{TapoError, TransportErrorKind};
pub use pipeline::{Priority, RequestExecutor, RequestPipeline, SubmitOptions};
pub use protocol::{KlapSession, PassthroughSession, ProtocolInfo, ProtocolKind, ProtocolSelector};
pub use registry::DeviceRegistry;
pub use retry::{OperationCategory, RetryPolicy, RetryStrategy};
pub use session::{ConnectionState, SessionManager};
pub use transport::{HttpResponse, HttpTransport, Transport};
