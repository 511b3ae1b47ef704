//! Namespaced TTL cache sitting in front of the store, and the time-windowed
//! gate built on the same machinery for deduplication and throttling.
//!
//! Nothing in here is a source of truth. A miss (or an expired entry, which
//! reads exactly like a miss) always falls through to the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::db::{Device, IrrigationConfig, Sensor, User};

const MAX_ENTRIES_PER_NAMESPACE: u64 = 10_000;

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Device,
    Sensor,
    Config,
    User,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Device,
        Namespace::Sensor,
        Namespace::Config,
        Namespace::User,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Device => "device",
            Namespace::Sensor => "sensor",
            Namespace::Config => "config",
            Namespace::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == s)
    }

    pub fn default_ttl(self) -> Duration {
        match self {
            Namespace::Device => Duration::from_secs(300),
            Namespace::Sensor => Duration::from_secs(60),
            Namespace::Config => Duration::from_secs(600),
            Namespace::User => Duration::from_secs(300),
        }
    }

    /// How often expired entries are physically purged.
    pub fn sweep_every(self) -> Duration {
        match self {
            Namespace::Device => Duration::from_secs(60),
            Namespace::Sensor => Duration::from_secs(10),
            Namespace::Config => Duration::from_secs(120),
            Namespace::User => Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Cached {
    Device(Device),
    Sensor(Sensor),
    SensorList(Vec<Sensor>),
    DeviceList(Vec<Device>),
    Configs(Vec<IrrigationConfig>),
    User(User),
}

// ---------------------------------------------------------------------------
// Single namespace
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Slot {
    value: Cached,
    ttl: Duration,
}

/// Per-entry expiry: each slot carries its own TTL, reset on overwrite.
struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct TtlCache {
    namespace: Namespace,
    inner: Cache<String, Slot>,
}

impl TtlCache {
    pub fn new(namespace: Namespace) -> Self {
        let ns = namespace.as_str();
        let inner = Cache::builder()
            .max_capacity(MAX_ENTRIES_PER_NAMESPACE)
            .expire_after(SlotExpiry)
            .eviction_listener(move |key: Arc<String>, _slot: Slot, cause: RemovalCause| match cause {
                RemovalCause::Expired => debug!(namespace = ns, key = %key, "cache expire"),
                RemovalCause::Explicit => debug!(namespace = ns, key = %key, "cache delete"),
                RemovalCause::Size => debug!(namespace = ns, key = %key, "cache evict"),
                _ => {}
            })
            .build();
        Self { namespace, inner }
    }

    pub fn get(&self, key: &str) -> Option<Cached> {
        self.inner.get(key).map(|slot| slot.value)
    }

    pub fn set(&self, key: impl Into<String>, value: Cached, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or_else(|| self.namespace.default_ttl());
        debug!(namespace = self.namespace.as_str(), key = %key, ttl_sec = ttl.as_secs(), "cache set");
        self.inner.insert(key, Slot { value, ttl });
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
    }

    pub fn sweep(&self) {
        self.inner.run_pending_tasks();
    }

    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

// ---------------------------------------------------------------------------
// The hub-wide cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub device: u64,
    pub sensor: u64,
    pub config: u64,
    pub user: u64,
}

pub struct AppCache {
    devices: TtlCache,
    sensors: TtlCache,
    configs: TtlCache,
    users: TtlCache,
}

impl Default for AppCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AppCache {
    pub fn new() -> Self {
        Self {
            devices: TtlCache::new(Namespace::Device),
            sensors: TtlCache::new(Namespace::Sensor),
            configs: TtlCache::new(Namespace::Config),
            users: TtlCache::new(Namespace::User),
        }
    }

    fn ns(&self, namespace: Namespace) -> &TtlCache {
        match namespace {
            Namespace::Device => &self.devices,
            Namespace::Sensor => &self.sensors,
            Namespace::Config => &self.configs,
            Namespace::User => &self.users,
        }
    }

    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Cached> {
        self.ns(namespace).get(key)
    }

    pub fn set(&self, namespace: Namespace, key: impl Into<String>, value: Cached, ttl: Option<Duration>) {
        self.ns(namespace).set(key, value, ttl);
    }

    pub fn invalidate(&self, namespace: Namespace, key: &str) {
        self.ns(namespace).invalidate(key);
    }

    // -- Devices ----------------------------------------------------------

    pub fn device_by_api_key(&self, api_key: &str) -> Option<Device> {
        match self.get(Namespace::Device, &format!("device_key_{api_key}")) {
            Some(Cached::Device(d)) => Some(d),
            _ => None,
        }
    }

    pub fn put_device(&self, device: &Device) {
        self.set(Namespace::Device, format!("device_{}", device.id), Cached::Device(device.clone()), None);
        self.set(
            Namespace::Device,
            format!("device_key_{}", device.api_key),
            Cached::Device(device.clone()),
            None,
        );
    }

    /// Drops the device under both keys, plus its sensor list.
    pub fn invalidate_device(&self, device_id: i64, api_key: &str) {
        self.invalidate(Namespace::Device, &format!("device_{device_id}"));
        self.invalidate(Namespace::Device, &format!("device_key_{api_key}"));
        self.invalidate_device_sensors(device_id);
    }

    // -- Sensors ----------------------------------------------------------

    pub fn sensor(&self, id: i64) -> Option<Sensor> {
        match self.get(Namespace::Sensor, &format!("sensor_{id}")) {
            Some(Cached::Sensor(s)) => Some(s),
            _ => None,
        }
    }

    pub fn put_sensor(&self, sensor: &Sensor) {
        self.set(Namespace::Sensor, format!("sensor_{}", sensor.id), Cached::Sensor(sensor.clone()), None);
    }

    /// Drops the sensor and the irrigation configs keyed on it.
    pub fn invalidate_sensor(&self, sensor_id: i64) {
        self.invalidate(Namespace::Sensor, &format!("sensor_{sensor_id}"));
        self.invalidate_configs_for_sensor(sensor_id);
    }

    pub fn device_sensors(&self, device_id: i64) -> Option<Vec<Sensor>> {
        match self.get(Namespace::Sensor, &format!("device_sensors_{device_id}")) {
            Some(Cached::SensorList(list)) => Some(list),
            _ => None,
        }
    }

    pub fn put_device_sensors(&self, device_id: i64, sensors: Vec<Sensor>) {
        self.set(Namespace::Sensor, format!("device_sensors_{device_id}"), Cached::SensorList(sensors), None);
    }

    pub fn invalidate_device_sensors(&self, device_id: i64) {
        self.invalidate(Namespace::Sensor, &format!("device_sensors_{device_id}"));
    }

    // -- Irrigation configs -----------------------------------------------

    pub fn configs_for_sensor(&self, sensor_id: i64) -> Option<Vec<IrrigationConfig>> {
        match self.get(Namespace::Config, &format!("config_sensor_{sensor_id}")) {
            Some(Cached::Configs(list)) => Some(list),
            _ => None,
        }
    }

    pub fn put_configs_for_sensor(&self, sensor_id: i64, configs: Vec<IrrigationConfig>) {
        self.set(Namespace::Config, format!("config_sensor_{sensor_id}"), Cached::Configs(configs), None);
    }

    pub fn invalidate_configs_for_sensor(&self, sensor_id: i64) {
        self.invalidate(Namespace::Config, &format!("config_sensor_{sensor_id}"));
    }

    // -- Users ------------------------------------------------------------

    pub fn user(&self, id: i64) -> Option<User> {
        match self.get(Namespace::User, &format!("user_{id}")) {
            Some(Cached::User(u)) => Some(u),
            _ => None,
        }
    }

    pub fn put_user(&self, user: &User) {
        self.set(Namespace::User, format!("user_{}", user.id), Cached::User(user.clone()), None);
    }

    pub fn user_devices(&self, user_id: i64) -> Option<Vec<Device>> {
        match self.get(Namespace::Device, &format!("user_devices_{user_id}")) {
            Some(Cached::DeviceList(list)) => Some(list),
            _ => None,
        }
    }

    pub fn put_user_devices(&self, user_id: i64, devices: Vec<Device>) {
        self.set(Namespace::Device, format!("user_devices_{user_id}"), Cached::DeviceList(devices), None);
    }

    /// Drops the user and their device list.
    pub fn invalidate_user(&self, user_id: i64) {
        self.invalidate(Namespace::User, &format!("user_{user_id}"));
        self.invalidate(Namespace::Device, &format!("user_devices_{user_id}"));
    }

    // -- Maintenance ------------------------------------------------------

    pub fn clear(&self, namespace: Namespace) {
        self.ns(namespace).clear();
        debug!(namespace = namespace.as_str(), "cache namespace cleared");
    }

    pub fn clear_all(&self) {
        for ns in Namespace::ALL {
            self.ns(ns).clear();
        }
        debug!("cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            device: self.devices.len(),
            sensor: self.sensors.len(),
            config: self.configs.len(),
            user: self.users.len(),
        }
    }

    /// One purge task per namespace, each on its own period.
    pub fn spawn_sweepers(self: &Arc<Self>) {
        for ns in Namespace::ALL {
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ns.sweep_every());
                loop {
                    ticker.tick().await;
                    cache.ns(ns).sweep();
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Time-windowed gate
// ---------------------------------------------------------------------------

/// Lets a key through at most once per window. Remembered keys expire with
/// the window, so the set stays bounded no matter how many keys pass.
pub struct WindowGate {
    name: &'static str,
    window_secs: i64,
    seen: Cache<String, i64>,
    // check-then-set must not interleave
    lock: Mutex<()>,
}

impl WindowGate {
    pub fn new(name: &'static str, window: Duration) -> Self {
        Self {
            name,
            window_secs: window.as_secs() as i64,
            seen: Cache::builder()
                .max_capacity(MAX_ENTRIES_PER_NAMESPACE)
                .time_to_live(window)
                .build(),
            lock: Mutex::new(()),
        }
    }

    /// `now` is unix seconds. Returns true (and remembers `now`) when the key
    /// has not passed within the window.
    pub fn try_pass(&self, key: &str, now: i64) -> bool {
        let _guard = self.lock.lock();
        if let Some(last) = self.seen.get(key) {
            if now - last < self.window_secs {
                debug!(gate = self.name, key, since_sec = now - last, "gate closed");
                return false;
            }
        }
        self.seen.insert(key.to_string(), now);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> u64 {
        self.seen.run_pending_tasks();
        self.seen.entry_count()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
