//! Device telemetry ingestion.
//!
//! ```text
//! riego/<cred>/sensores ─┐
//! riego/<cred>/eventos  ─┼─▶ IngestRouter ──(one worker per cred)──▶ TelemetryProcessor
//! riego/<cred>/ping     ─┘
//! ```
//!
//! Per sensor entry: resolve (id → pin+kind → auto-provision), ownership,
//! health, reading, range alerts, plant health, automation. One
//! `sensor:update` summarises the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::automation::AutomationEngine;
use crate::cache::AppCache;
use crate::db::{
    now_unix, AlertKind, Db, Device, NewAlert, NewSensor, Sensor, SensorKind, Severity,
};
use crate::mqtt::{split_topic, DeviceEventMsg, MessageKind, SensorEntry, SensorFault};
use crate::notify::{MailSeverity, Notifier, PushEvent, ReadingUpdate};
use crate::state::SharedState;

/// Identical health alerts are not repeated within this window.
pub const ALERT_DEDUP_SECS: i64 = 60 * 60;

const WORKER_QUEUE: usize = 64;

/// A device worker with no traffic for this long is stopped.
const IDLE_WORKER: Duration = Duration::from_secs(10 * 60);

pub struct TelemetryProcessor {
    db: Db,
    cache: Arc<AppCache>,
    notifier: Notifier,
    automation: AutomationEngine,
    shared: SharedState,
}

impl TelemetryProcessor {
    pub fn new(
        db: Db,
        cache: Arc<AppCache>,
        notifier: Notifier,
        automation: AutomationEngine,
        shared: SharedState,
    ) -> Self {
        Self {
            db,
            cache,
            notifier,
            automation,
            shared,
        }
    }

    /// Entry point for one broker message. Never fails; problems are logged.
    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.process(topic, payload).await {
            error!(topic, "telemetry processing failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("{topic}: {e}"));
        }
    }

    async fn process(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let Some((credential, kind)) = split_topic(topic) else {
            warn!(topic, "ignoring message on unexpected topic");
            return Ok(());
        };

        let Some(device) = self.resolve_device(credential).await? else {
            warn!(topic, "message from unknown device credential dropped");
            return Ok(());
        };

        let now = now_unix();
        self.db.touch_device(device.id, now).await?;
        self.shared
            .write()
            .await
            .record_message(device.id, &device.name, kind);

        match MessageKind::parse(kind) {
            Some(MessageKind::Sensors) => self.process_sensors(&device, payload, now).await,
            Some(MessageKind::Event) => self.process_event(&device, payload).await,
            Some(MessageKind::Ping) => {
                debug!(device = %device.name, "ping");
                Ok(())
            }
            None => {
                warn!(device = %device.name, kind, "unknown message type");
                Ok(())
            }
        }
    }

    /// Whether the credential belongs to a registered device.
    pub async fn knows_credential(&self, credential: &str) -> Result<bool> {
        Ok(self.resolve_device(credential).await?.is_some())
    }

    async fn resolve_device(&self, credential: &str) -> Result<Option<Device>> {
        if let Some(hit) = self.cache.device_by_api_key(credential) {
            return Ok(Some(hit));
        }
        let device = self.db.device_by_api_key(credential).await?;
        if let Some(d) = &device {
            self.cache.put_device(d);
        }
        Ok(device)
    }

    // -----------------------------------------------------------------------
    // sensores
    // -----------------------------------------------------------------------

    async fn process_sensors(&self, device: &Device, payload: &[u8], now: i64) -> Result<()> {
        let body: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(device = %device.name, "sensor payload is not json: {e}");
                return Ok(());
            }
        };
        let Some(entries) = body.get("sensores").and_then(Value::as_array) else {
            warn!(device = %device.name, "sensor payload without a sensores array");
            return Ok(());
        };

        let mut updates = Vec::new();
        for raw in entries {
            let entry: SensorEntry = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(e) => {
                    warn!(device = %device.name, "malformed sensor entry skipped: {e}");
                    continue;
                }
            };
            match self.process_entry(device, &entry, now).await {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => {}
                Err(e) => error!(device = %device.name, "sensor entry failed: {e:#}"),
            }
        }

        if updates.is_empty() {
            return Ok(());
        }
        debug!(device = %device.name, readings = updates.len(), "sensor batch processed");
        self.notifier
            .emit(PushEvent::SensorUpdate {
                device_id: device.id,
                device: device.name.clone(),
                readings: updates,
                ts: now,
            })
            .await;
        Ok(())
    }

    async fn process_entry(&self, device: &Device, entry: &SensorEntry, now: i64) -> Result<Option<ReadingUpdate>> {
        let Some(sensor) = self.resolve_sensor(device, entry, now).await? else {
            return Ok(None);
        };

        if sensor.device_id != device.id {
            warn!(
                device = %device.name,
                sensor_id = sensor.id,
                owner = sensor.device_id,
                "sensor belongs to another device, entry skipped"
            );
            return Ok(None);
        }

        if let Some(fault) = entry.fault() {
            self.report_fault(device, &sensor, fault, now).await?;
            return Ok(None);
        }

        let Some(value) = entry.valor else {
            warn!(device = %device.name, sensor = %sensor.name, "entry without a value skipped");
            return Ok(None);
        };

        self.db.insert_reading(sensor.id, value, now).await?;
        self.check_range(device, &sensor, value, now).await?;
        self.check_plant_health(device, &sensor, value, now).await?;

        if let Err(e) = self.automation.evaluate(device, &sensor, value, now).await {
            error!(device = %device.name, sensor = %sensor.name, "automation failed: {e:#}");
        }

        debug!(device = %device.name, sensor = %sensor.name, value, unit = %sensor.unit, "reading stored");
        Ok(Some(ReadingUpdate {
            sensor_id: sensor.id,
            kind: sensor.kind,
            value,
            unit: sensor.unit,
        }))
    }

    async fn resolve_sensor(&self, device: &Device, entry: &SensorEntry, now: i64) -> Result<Option<Sensor>> {
        if let Some(id) = entry.sensor_id {
            if let Some(hit) = self.cache.sensor(id) {
                return Ok(Some(hit));
            }
            let sensor = self.db.get_sensor(id).await?;
            match &sensor {
                Some(s) => self.cache.put_sensor(s),
                None => warn!(device = %device.name, sensor_id = id, "unknown sensor id, entry skipped"),
            }
            return Ok(sensor);
        }

        let (Some(pin), Some(kind)) = (entry.pin.as_deref(), entry.tipo) else {
            warn!(device = %device.name, "entry has neither sensor_id nor pin and tipo, skipped");
            return Ok(None);
        };

        let known = self.device_sensors(device.id).await?;
        if let Some(s) = known
            .into_iter()
            .find(|s| s.pin.as_deref() == Some(pin) && s.kind == kind)
        {
            return Ok(Some(s));
        }

        Ok(Some(self.provision(device, pin, kind, now).await?))
    }

    async fn device_sensors(&self, device_id: i64) -> Result<Vec<Sensor>> {
        if let Some(hit) = self.cache.device_sensors(device_id) {
            return Ok(hit);
        }
        let list = self.db.sensors_for_device(device_id).await?;
        self.cache.put_device_sensors(device_id, list.clone());
        Ok(list)
    }

    async fn provision(&self, device: &Device, pin: &str, kind: SensorKind, now: i64) -> Result<Sensor> {
        let defaults = kind.defaults();
        let sensor = self
            .db
            .provision_sensor(
                &NewSensor {
                    device_id: device.id,
                    kind,
                    pin,
                    name: format!("{} {}", defaults.label, pin),
                    unit: defaults.unit,
                    min_value: defaults.min,
                    max_value: defaults.max,
                },
                now,
            )
            .await?;
        self.cache.invalidate_device_sensors(device.id);

        info!(
            device = %device.name,
            sensor_id = sensor.id,
            pin,
            kind = kind.as_str(),
            "sensor auto-provisioned"
        );
        Ok(sensor)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    async fn report_fault(&self, device: &Device, sensor: &Sensor, fault: SensorFault, now: i64) -> Result<()> {
        let (kind, message) = match &fault {
            SensorFault::Disconnected => (
                AlertKind::SensorDisconnected,
                format!("{}: sensor desconectado", sensor.name),
            ),
            SensorFault::Abnormal(state) => (
                AlertKind::SensorFault,
                format!("{}: estado anormal ({state})", sensor.name),
            ),
        };
        warn!(device = %device.name, sensor = %sensor.name, ?fault, "sensor unhealthy, reading skipped");

        if self
            .db
            .alert_repeated_since(device.id, kind, &message, now - ALERT_DEDUP_SECS)
            .await?
        {
            debug!(device = %device.name, %message, "health alert already raised");
            return Ok(());
        }

        self.db
            .insert_alert(&NewAlert {
                device_id: device.id,
                kind,
                severity: Severity::High,
                message: &message,
                created_at: now,
            })
            .await?;

        let owner = self.owner_email(device).await?;
        self.notifier.email(
            owner.as_deref(),
            &format!("Sensor con problemas en {}", device.name),
            &message,
            MailSeverity::Critical,
        );
        Ok(())
    }

    async fn check_range(&self, device: &Device, sensor: &Sensor, value: f64, now: i64) -> Result<()> {
        let mut messages = Vec::new();
        if sensor.min_value.is_some_and(|min| value < min) {
            messages.push(format!("{}: Valor bajo ({} {})", sensor.name, value, sensor.unit));
        }
        if sensor.max_value.is_some_and(|max| value > max) {
            messages.push(format!("{}: Valor alto ({} {})", sensor.name, value, sensor.unit));
        }

        for message in messages {
            info!(device = %device.name, %message, "sensor out of range");
            self.db
                .insert_alert(&NewAlert {
                    device_id: device.id,
                    kind: AlertKind::OutOfRange,
                    severity: Severity::Medium,
                    message: &message,
                    created_at: now,
                })
                .await?;
        }
        Ok(())
    }

    async fn check_plant_health(&self, device: &Device, sensor: &Sensor, value: f64, now: i64) -> Result<()> {
        let Some(plant_id) = self
            .db
            .greenhouse_for_device(device.id)
            .await?
            .and_then(|g| g.plant_id)
        else {
            return Ok(());
        };
        let Some(plant) = self.db.get_plant(plant_id).await? else {
            return Ok(());
        };

        let (what, min, max) = match sensor.kind {
            SensorKind::SoilMoisture | SensorKind::AirHumidity => ("humedad", plant.hum_min, plant.hum_max),
            SensorKind::Temperature => ("temperatura", plant.temp_min, plant.temp_max),
            _ => return Ok(()),
        };

        let message = match (min, max) {
            (Some(min), _) if value < min => format!("{}: {what} por debajo del rango (min {min})", plant.name),
            (_, Some(max)) if value > max => format!("{}: {what} por encima del rango (max {max})", plant.name),
            _ => return Ok(()),
        };

        if self
            .db
            .alert_repeated_since(device.id, AlertKind::PlantHealth, &message, now - ALERT_DEDUP_SECS)
            .await?
        {
            return Ok(());
        }

        info!(device = %device.name, %message, "plant outside its range");
        self.db
            .insert_alert(&NewAlert {
                device_id: device.id,
                kind: AlertKind::PlantHealth,
                severity: Severity::Medium,
                message: &message,
                created_at: now,
            })
            .await?;
        Ok(())
    }

    async fn owner_email(&self, device: &Device) -> Result<Option<String>> {
        let Some(user_id) = device.user_id else {
            return Ok(None);
        };
        if let Some(hit) = self.cache.user(user_id) {
            return Ok(hit.email);
        }
        let user = self.db.get_user(user_id).await?;
        Ok(user.and_then(|u| {
            self.cache.put_user(&u);
            u.email
        }))
    }

    // -----------------------------------------------------------------------
    // eventos
    // -----------------------------------------------------------------------

    async fn process_event(&self, device: &Device, payload: &[u8]) -> Result<()> {
        let event: DeviceEventMsg = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(device = %device.name, "malformed device event: {e}");
                return Ok(());
            }
        };

        info!(device = %device.name, kind = %event.tipo, message = %event.mensaje, "device event");
        self.notifier
            .emit(PushEvent::DeviceEvent {
                device_id: device.id,
                device: device.name.clone(),
                kind: event.tipo,
                message: event.mensaje,
            })
            .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-device workers
// ---------------------------------------------------------------------------

struct Inbound {
    topic: String,
    payload: Vec<u8>,
}

type WorkerMap = Arc<Mutex<HashMap<String, mpsc::Sender<Inbound>>>>;

/// Fans broker messages out to one ordered worker per known device.
///
/// `route` runs on the MQTT event loop, so it never waits: a full worker queue
/// drops the message. Workers stop after `IDLE_WORKER` without traffic. Sends
/// and the idle check both happen under the map lock, so a worker that stops
/// has nothing left in its queue.
pub struct IngestRouter {
    processor: Arc<TelemetryProcessor>,
    workers: WorkerMap,
    idle_after: Duration,
}

impl IngestRouter {
    pub fn new(processor: Arc<TelemetryProcessor>) -> Self {
        Self {
            processor,
            workers: Arc::new(Mutex::new(HashMap::new())),
            idle_after: IDLE_WORKER,
        }
    }

    #[cfg(test)]
    fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }

    pub async fn route(&self, topic: String, payload: Vec<u8>) {
        let Some((credential, _)) = split_topic(&topic) else {
            warn!(topic = %topic, "ignoring message on unexpected topic");
            return;
        };
        let credential = credential.to_string();

        match self.processor.knows_credential(&credential).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(topic = %topic, "message from unknown device credential dropped");
                return;
            }
            Err(e) => {
                error!(topic = %topic, "device lookup failed, message dropped: {e:#}");
                return;
            }
        }

        let sent = {
            let mut workers = self.workers.lock();
            let tx = workers
                .entry(credential.clone())
                .or_insert_with(|| self.spawn_worker(credential.clone()));
            match tx.try_send(Inbound { topic, payload }) {
                Err(TrySendError::Closed(msg)) => {
                    // worker died mid-message; replace it
                    let fresh = self.spawn_worker(credential.clone());
                    let sent = fresh.try_send(msg);
                    workers.insert(credential.clone(), fresh);
                    sent
                }
                other => other,
            }
        };

        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(credential = %credential, topic = %msg.topic, "ingest queue full, message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                error!(credential = %credential, "ingest worker unavailable, message dropped");
            }
        }
    }

    fn spawn_worker(&self, credential: String) -> mpsc::Sender<Inbound> {
        let (tx, mut rx) = mpsc::channel::<Inbound>(WORKER_QUEUE);
        let processor = Arc::clone(&self.processor);
        let workers = Arc::clone(&self.workers);
        let idle_after = self.idle_after;
        debug!(credential = %credential, "ingest worker started");

        tokio::spawn(async move {
            loop {
                let msg = match tokio::time::timeout(idle_after, rx.recv()).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => {
                        let pending = {
                            let mut map = workers.lock();
                            match rx.try_recv() {
                                Ok(msg) => Some(msg),
                                Err(_) => {
                                    map.remove(&credential);
                                    None
                                }
                            }
                        };
                        match pending {
                            Some(msg) => msg,
                            None => {
                                debug!(credential = %credential, "idle ingest worker stopped");
                                break;
                            }
                        }
                    }
                };
                processor.handle(&msg.topic, &msg.payload).await;
            }
        });
        tx
    }

    #[cfg(test)]
    pub fn workers(&self) -> usize {
        self.workers.lock().len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::automation::Coordinates;
    use crate::db::{ActuatorState, Alert, ConfigMode, IrrigationEventKind, TriggerMode};
    use crate::testkit::{add_config, collect_mail, drain, harness, Harness, StubAdvisory};

    fn processor(h: &Harness, advisory: Arc<StubAdvisory>) -> TelemetryProcessor {
        let cache = Arc::new(AppCache::new());
        let automation = AutomationEngine::new(
            h.db.clone(),
            cache.clone(),
            h.dispatcher.clone(),
            h.notifier.clone(),
            advisory,
            h.shared.clone(),
            Coordinates {
                lat: -33.4489,
                lon: -70.6693,
            },
        );
        TelemetryProcessor::new(h.db.clone(), cache, h.notifier.clone(), automation, h.shared.clone())
    }

    async fn alerts_of(h: &Harness, kind: AlertKind) -> Vec<Alert> {
        h.db
            .alerts_for_device(1)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.kind == kind)
            .collect()
    }

    // -- Routing + device resolution ------------------------------------------

    #[tokio::test]
    async fn unknown_credential_is_dropped() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/nope/sensores", br#"{"sensores":[{"sensor_id":5,"valor":30}]}"#)
            .await;

        assert!(h.db.readings_for_sensor(5).await.unwrap().is_empty());
        assert!(h.shared.read().await.devices.is_empty());
    }

    #[tokio::test]
    async fn ping_updates_last_seen() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/ping", b"{}").await;

        assert!(h.db.get_device(1).await.unwrap().unwrap().last_seen.is_some());
        assert_eq!(h.shared.read().await.devices[&1].messages, 1);
    }

    #[tokio::test]
    async fn unknown_type_still_counts_as_contact() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/firmware", b"{}").await;

        assert!(h.db.get_device(1).await.unwrap().unwrap().last_seen.is_some());
    }

    #[tokio::test]
    async fn device_event_is_pushed() {
        let h = harness(true).await;
        let mut rx = h.notifier.subscribe();
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/eventos", br#"{"tipo":"reinicio","mensaje":"watchdog"}"#)
            .await;

        match drain(&mut rx).pop().unwrap() {
            PushEvent::DeviceEvent { kind, message, device, .. } => {
                assert_eq!(kind, "reinicio");
                assert_eq!(message, "watchdog");
                assert_eq!(device, "riego-1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // -- Sensor batches -----------------------------------------------------

    #[tokio::test]
    async fn batch_persists_and_emits_one_update() {
        let h = harness(true).await;
        let mut rx = h.notifier.subscribe();
        let p = processor(&h, StubAdvisory::new(true));

        p.handle(
            "riego/key-d1/sensores",
            br#"{"sensores":[{"sensor_id":5,"valor":30,"estado":"ok"},{"pin":"A1","tipo":"temperatura","valor":21.5}]}"#,
        )
        .await;

        assert_eq!(h.db.readings_for_sensor(5).await.unwrap()[0].value, 30.0);
        let updates: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "sensor:update")
            .collect();
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            PushEvent::SensorUpdate { readings, .. } => assert_eq!(readings.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_entry_does_not_spoil_the_batch() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle(
            "riego/key-d1/sensores",
            br#"{"sensores":[{"sensor_id":"abc"},{"pin":"A9","tipo":"co2","valor":1},{"sensor_id":5,"valor":30}]}"#,
        )
        .await;

        assert_eq!(h.db.readings_for_sensor(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_sensor_array_is_ignored() {
        let h = harness(true).await;
        let mut rx = h.notifier.subscribe();
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/sensores", br#"{"sensores":{"sensor_id":5}}"#).await;
        p.handle("riego/key-d1/sensores", b"not json").await;

        assert!(h.db.readings_for_sensor(5).await.unwrap().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn foreign_sensor_is_skipped() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        // sensor 6 belongs to device 2
        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"sensor_id":6,"valor":22}]}"#)
            .await;

        assert!(h.db.readings_for_sensor(6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_without_value_is_skipped() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"sensor_id":5,"estado":"ok"}]}"#)
            .await;

        assert!(h.db.readings_for_sensor(5).await.unwrap().is_empty());
    }

    // -- Provisioning -------------------------------------------------------

    #[tokio::test]
    async fn concurrent_provisioning_creates_one_sensor() {
        let h = harness(true).await;
        let p = Arc::new(processor(&h, StubAdvisory::new(true)));
        let msg = br#"{"sensores":[{"pin":"A1","tipo":"temperatura","valor":22}]}"#;

        let (a, b) = (p.clone(), p.clone());
        tokio::join!(
            a.handle("riego/key-d1/sensores", msg),
            b.handle("riego/key-d1/sensores", msg),
        );

        let provisioned: Vec<_> = h
            .db
            .sensors_for_device(1)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.pin.as_deref() == Some("A1"))
            .collect();
        assert_eq!(provisioned.len(), 1);
        assert_eq!(provisioned[0].name, "Temperatura A1");
        assert_eq!(provisioned[0].unit, "°C");
        assert_eq!(provisioned[0].min_value, Some(5.0));
        assert_eq!(h.db.readings_for_sensor(provisioned[0].id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn known_pin_resolves_to_existing_sensor() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"pin":"A0","tipo":"humedad_suelo","valor":30}]}"#)
            .await;

        assert_eq!(h.db.readings_for_sensor(5).await.unwrap().len(), 1);
        assert_eq!(h.db.sensors_for_device(1).await.unwrap().len(), 1);
    }

    // -- Range + health -------------------------------------------------------

    #[tokio::test]
    async fn range_alerts_follow_sensor_bounds() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        // sensor 5 is bounded to 10..40
        for value in [5, 45, 25] {
            let body = format!(r#"{{"sensores":[{{"sensor_id":5,"valor":{value}}}]}}"#);
            p.handle("riego/key-d1/sensores", body.as_bytes()).await;
        }

        let alerts = alerts_of(&h, AlertKind::OutOfRange).await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].message, "Humedad suelo A0: Valor bajo (5 %)");
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[1].message, "Humedad suelo A0: Valor alto (45 %)");
        assert_eq!(h.db.readings_for_sensor(5).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn disconnected_sensor_alerts_once_and_skips_reading() {
        let mut h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));
        let msg = br#"{"sensores":[{"sensor_id":5,"valor":30,"conectado":false}]}"#;

        p.handle("riego/key-d1/sensores", msg).await;
        p.handle("riego/key-d1/sensores", msg).await;

        assert!(h.db.readings_for_sensor(5).await.unwrap().is_empty());
        let alerts = alerts_of(&h, AlertKind::SensorDisconnected).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::High);

        let mail = collect_mail(&mut h.mail).await;
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].to, "ana@example.com");
    }

    #[tokio::test]
    async fn abnormal_state_is_a_sensor_fault() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"sensor_id":5,"valor":30,"estado":"error_lectura"}]}"#)
            .await;

        assert_eq!(alerts_of(&h, AlertKind::SensorFault).await.len(), 1);
        assert!(h.db.readings_for_sensor(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plant_health_alert_is_deduplicated() {
        let h = harness(true).await;
        let p = processor(&h, StubAdvisory::new(true));

        // Tomate wants 40..70 % humidity
        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"sensor_id":5,"valor":25}]}"#)
            .await;
        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"sensor_id":5,"valor":24}]}"#)
            .await;

        let alerts = alerts_of(&h, AlertKind::PlantHealth).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message, "Tomate: humedad por debajo del rango (min 40)");
    }

    // -- Automation wiring --------------------------------------------------

    #[tokio::test]
    async fn dry_reading_runs_automatic_irrigation_end_to_end() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, Some(5)).await;
        let mut rx = h.notifier.subscribe();
        let p = processor(&h, StubAdvisory::new(true));

        p.handle("riego/key-d1/sensores", br#"{"sensores":[{"sensor_id":5,"valor":15,"estado":"ok"}]}"#)
            .await;

        // reading stored, no range alert (sensor minimum is 10)
        assert_eq!(h.db.readings_for_sensor(5).await.unwrap()[0].value, 15.0);
        assert!(alerts_of(&h, AlertKind::OutOfRange).await.is_empty());

        // pump on, audited, announced
        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::On);
        let events = h.db.events_for_actuator(10).await.unwrap();
        assert_eq!(events[0].kind, IrrigationEventKind::Start);
        assert!(drain(&mut rx).iter().any(|e| e.name() == "alert:riego_activo"));

        // five minutes later the deadline is due and the pump goes off
        let deadline = events[0].pending_off_at.unwrap();
        assert_eq!(h.dispatcher.run_due_offs(deadline - 1).await.unwrap(), 0);
        assert_eq!(h.dispatcher.run_due_offs(deadline).await.unwrap(), 1);

        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::Off);
        let events = h.db.events_for_actuator(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, IrrigationEventKind::Stop);
        assert_eq!(events[1].mode, TriggerMode::Automatic);
        assert_eq!(h.dispatcher.pending_timers(), 0);
    }

    // -- IngestRouter -------------------------------------------------------

    #[tokio::test]
    async fn router_keeps_per_device_order() {
        let h = harness(true).await;
        let router = IngestRouter::new(Arc::new(processor(&h, StubAdvisory::new(true))));

        for value in [31, 32, 33] {
            let body = format!(r#"{{"sensores":[{{"sensor_id":5,"valor":{value}}}]}}"#);
            router.route("riego/key-d1/sensores".into(), body.into_bytes()).await;
        }
        router
            .route("riego/key-d2/sensores".into(), br#"{"sensores":[{"sensor_id":6,"valor":20}]}"#.to_vec())
            .await;
        router.route("bogus".into(), Vec::new()).await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let values: Vec<f64> = h
            .db
            .readings_for_sensor(5)
            .await
            .unwrap()
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![31.0, 32.0, 33.0]);
        assert_eq!(h.db.readings_for_sensor(6).await.unwrap().len(), 1);
        assert_eq!(router.workers(), 2);
    }

    #[tokio::test]
    async fn router_spawns_no_worker_for_unknown_credentials() {
        let h = harness(true).await;
        let router = IngestRouter::new(Arc::new(processor(&h, StubAdvisory::new(true))));

        for i in 0..500 {
            router.route(format!("riego/bogus-{i}/ping"), Vec::new()).await;
        }

        assert_eq!(router.workers(), 0);
    }

    #[tokio::test]
    async fn router_drops_instead_of_waiting_on_a_stuck_worker() {
        let h = harness(true).await;
        let router = IngestRouter::new(Arc::new(processor(&h, StubAdvisory::new(true))));

        // the worker stalls on the shared-state write lock
        let guard = h.shared.read().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            for _ in 0..100 {
                router.route("riego/key-d1/ping".into(), Vec::new()).await;
            }
        })
        .await
        .expect("route waited on a full worker queue");
        drop(guard);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let handled = h.shared.read().await.devices.get(&1).map(|a| a.messages).unwrap_or(0);
        assert!(handled > 0 && handled < 100, "handled {handled}");
    }

    #[tokio::test]
    async fn idle_worker_stops_and_comes_back() {
        let h = harness(true).await;
        let router = IngestRouter::new(Arc::new(processor(&h, StubAdvisory::new(true))))
            .with_idle_after(Duration::from_millis(100));

        router.route("riego/key-d1/ping".into(), Vec::new()).await;
        assert_eq!(router.workers(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(router.workers(), 0);

        router.route("riego/key-d1/ping".into(), Vec::new()).await;
        assert_eq!(router.workers(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.shared.read().await.devices[&1].messages, 2);
    }
}
