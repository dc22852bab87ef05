//! Owning device registry: instance cache plus model-driven factory.
//!
//! Instances are keyed by `(ip, username)` and reused within a TTL; a
//! background sweep evicts stale entries with a best-effort disconnect.
//! The factory classifies devices by probing `get_device_info` (behind its
//! own short-lived cache) and falls back to an operation-name hint when
//! the probe fails. All state lives in the registry object; dropping it
//! tears everything down.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{Credentials, TapoConfig};
use crate::device::{capabilities_for_model, Device, DeviceFamily};
use crate::error::TapoError;
use crate::transport::{HttpTransport, Transport};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Maps a requested operation name to the smallest family that supports
/// it; used when the probing round-trip fails.
pub fn family_for_hint(operation: &str) -> Option<DeviceFamily> {
    let op = operation.to_ascii_lowercase();
    if op.contains("child") {
        Some(DeviceFamily::PowerStrip)
    } else if op.contains("energy") || op.contains("current_power") {
        Some(DeviceFamily::EnergyPlug)
    } else if op.contains("effect") || op.contains("hsv") || op.contains("color_temp") {
        Some(DeviceFamily::ColorBulb)
    } else if op.contains("color") {
        Some(DeviceFamily::ColorBulb)
    } else if op.contains("brightness") {
        Some(DeviceFamily::DimmableBulb)
    } else if op.contains("device_on") || op.contains("on") || op.contains("off") {
        Some(DeviceFamily::BasicPlug)
    } else {
        None
    }
}

struct CachedDevice<T: Transport> {
    device: Arc<Device<T>>,
    inserted_at: Instant,
}

struct CachedInfo {
    model: String,
    fetched_at: Instant,
}

struct RegistryInner<T: Transport> {
    config: TapoConfig,
    devices: Mutex<HashMap<(String, String), CachedDevice<T>>>,
    info_cache: Mutex<HashMap<String, CachedInfo>>,
    #[allow(clippy::type_complexity)]
    transport_factory: Box<dyn Fn(&str) -> Result<Arc<T>, TapoError> + Send + Sync>,
}

impl<T: Transport> RegistryInner<T> {
    fn cached_model(&self, ip: &str) -> Option<String> {
        let cache = self.info_cache.lock();
        cache.get(ip).and_then(|entry| {
            (entry.fetched_at.elapsed() < self.config.info_cache_ttl)
                .then(|| entry.model.clone())
        })
    }

    fn store_model(&self, ip: &str, model: String) {
        self.info_cache.lock().insert(
            ip.to_string(),
            CachedInfo {
                model,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Removes expired entries, disconnecting each evicted device in the
    /// background.
    fn prune(&self) {
        let ttl = self.config.device_cache_ttl;
        let mut evicted = Vec::new();
        {
            let mut devices = self.devices.lock();
            devices.retain(|key, entry| {
                let fresh = entry.inserted_at.elapsed() < ttl;
                if !fresh {
                    debug!(ip = %key.0, "evicting cached device");
                    evicted.push(entry.device.clone());
                }
                fresh
            });
        }
        for device in evicted {
            tokio::spawn(async move {
                device.disconnect().await;
            });
        }
        let info_ttl = self.config.info_cache_ttl;
        self.info_cache
            .lock()
            .retain(|_, entry| entry.fetched_at.elapsed() < info_ttl);
    }
}

/// Device cache and factory with an explicit lifecycle.
pub struct DeviceRegistry<T: Transport = HttpTransport> {
    inner: Arc<RegistryInner<T>>,
    sweeper: Option<JoinHandle<()>>,
}

impl DeviceRegistry<HttpTransport> {
    pub fn new(config: TapoConfig) -> Self {
        let factory_config = config.clone();
        Self::with_transport_factory(config, move |ip| {
            HttpTransport::new(ip, &factory_config).map(Arc::new)
        })
    }
}

impl<T: Transport> DeviceRegistry<T> {
    /// Builds a registry with an injected transport factory (tests).
    pub fn with_transport_factory<F>(config: TapoConfig, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<T>, TapoError> + Send + Sync + 'static,
    {
        let inner = Arc::new(RegistryInner {
            config,
            devices: Mutex::new(HashMap::new()),
            info_cache: Mutex::new(HashMap::new()),
            transport_factory: Box::new(factory),
        });
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        Self {
            inner,
            sweeper: Some(sweeper),
        }
    }

    pub fn cached_count(&self) -> usize {
        self.inner.devices.lock().len()
    }

    /// Returns the cached instance for `(ip, username)` or builds one.
    ///
    /// Classification order: fresh info-cache entry, then a live probe via
    /// `connect()`, then the operation-name hint. A probe that succeeds on
    /// an unrecognized model is an `UnknownDeviceModel` error unless a
    /// hint rescues it.
    pub async fn get_or_create(
        &self,
        ip: &str,
        credentials: Credentials,
        operation_hint: Option<&str>,
    ) -> Result<Arc<Device<T>>, TapoError> {
        let key = (ip.to_string(), credentials.username().to_string());
        self.inner.prune();
        if let Some(entry) = self.inner.devices.lock().get(&key) {
            return Ok(entry.device.clone());
        }

        let transport = (self.inner.transport_factory)(ip)?;
        let device = match self.inner.cached_model(ip) {
            Some(model) => Arc::new(Device::with_model(
                transport,
                credentials,
                self.inner.config.clone(),
                &model,
            )?),
            None => {
                let device = Arc::new(Device::with_transport(
                    transport,
                    credentials,
                    self.inner.config.clone(),
                ));
                match device.connect().await {
                    Ok(()) => {
                        let model = device.model().unwrap_or_default();
                        if capabilities_for_model(&model).is_ok() {
                            self.inner.store_model(ip, model);
                            device
                        } else if let Some(family) =
                            operation_hint.and_then(family_for_hint)
                        {
                            debug!(ip, hint = ?family, "unrecognized model; applying hint");
                            device.assume_capabilities(family);
                            device
                        } else {
                            return Err(TapoError::UnknownDeviceModel(model));
                        }
                    }
                    Err(probe_err) => {
                        let Some(family) = operation_hint.and_then(family_for_hint) else {
                            return Err(probe_err);
                        };
                        debug!(ip, hint = ?family, "probe failed; applying hint");
                        device.assume_capabilities(family);
                        device
                    }
                }
            }
        };

        self.inner.devices.lock().insert(
            key,
            CachedDevice {
                device: device.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(device)
    }

    /// Removes one cached entry, disconnecting it.
    pub async fn evict(&self, ip: &str, username: &str) {
        let key = (ip.to_string(), username.to_string());
        let entry = self.inner.devices.lock().remove(&key);
        if let Some(entry) = entry {
            entry.device.disconnect().await;
        }
    }

    /// Disconnects everything and stops the sweeper.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        let drained: Vec<Arc<Device<T>>> = self
            .inner
            .devices
            .lock()
            .drain()
            .map(|(_, entry)| entry.device)
            .collect();
        for device in drained {
            device.disconnect().await;
        }
    }
}

impl<T: Transport> Drop for DeviceRegistry<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn sweep_loop<T: Transport>(inner: Weak<RegistryInner<T>>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_map_to_minimal_families() {
        assert_eq!(
            family_for_hint("set_brightness"),
            Some(DeviceFamily::DimmableBulb)
        );
        assert_eq!(family_for_hint("set_hsv"), Some(DeviceFamily::ColorBulb));
        assert_eq!(
            family_for_hint("get_energy_usage"),
            Some(DeviceFamily::EnergyPlug)
        );
        assert_eq!(
            family_for_hint("get_current_power"),
            Some(DeviceFamily::EnergyPlug)
        );
        assert_eq!(
            family_for_hint("get_child_device_list"),
            Some(DeviceFamily::PowerStrip)
        );
        assert_eq!(family_for_hint("turn_on"), Some(DeviceFamily::BasicPlug));
        assert_eq!(family_for_hint("reboot_everything"), None);
    }
}
