//! Shared fixtures for the unit tests: an in-memory store with a small
//! deployment, and recording stand-ins for the transport, mailer and
//! weather advisory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::db::*;
use crate::dispatch::Dispatcher;
use crate::mqtt::Transport;
use crate::notify::{MailSeverity, Mailer, Notifier, PushEvent};
use crate::state::{SharedState, SystemState};
use crate::weather::Advisory;

pub async fn test_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

pub fn test_shared() -> SharedState {
    SystemState::shared()
}

/// One owner, two devices.
///
/// - device 1 `key-d1`: soil sensor 5 (pin A0, range 10..40), pump 10 (D5),
///   valve 11 (D6), greenhouse 1 growing plant 1 with a Monday 08:00 slot
/// - device 2 `key-d2`: temperature sensor 6 (A3), pump 12 (D7)
pub async fn seed_basic(db: &Db) {
    db.upsert_user(&User {
        id: 1,
        name: "Ana".into(),
        email: Some("ana@example.com".into()),
    })
    .await
    .unwrap();

    db.upsert_plant(&Plant {
        id: 1,
        name: "Tomate".into(),
        hum_min: Some(40.0),
        hum_max: Some(70.0),
        temp_min: Some(10.0),
        temp_max: Some(30.0),
    })
    .await
    .unwrap();

    for (id, name) in [(1, "riego-1"), (2, "riego-2")] {
        db.upsert_device(&Device {
            id,
            name: name.into(),
            api_key: format!("key-d{id}"),
            user_id: Some(1),
            status: DeviceStatus::Active,
            last_seen: None,
        })
        .await
        .unwrap();
    }

    db.upsert_greenhouse(&Greenhouse {
        id: 1,
        description: "Invernadero Norte".into(),
        plant_id: Some(1),
        device_id: Some(1),
        latitude: None,
        longitude: None,
        active: true,
    })
    .await
    .unwrap();

    db.upsert_sensor(&Sensor {
        id: 5,
        device_id: 1,
        name: "Humedad suelo A0".into(),
        kind: SensorKind::SoilMoisture,
        pin: Some("A0".into()),
        unit: "%".into(),
        min_value: Some(10.0),
        max_value: Some(40.0),
        active: true,
        created_at: 0,
    })
    .await
    .unwrap();

    db.upsert_sensor(&Sensor {
        id: 6,
        device_id: 2,
        name: "Temperatura A3".into(),
        kind: SensorKind::Temperature,
        pin: Some("A3".into()),
        unit: "°C".into(),
        min_value: Some(5.0),
        max_value: Some(35.0),
        active: true,
        created_at: 0,
    })
    .await
    .unwrap();

    for (id, device_id, name, kind, pin) in [
        (10, 1, "Bomba principal", ActuatorKind::Pump, "D5"),
        (11, 1, "Valvula norte", ActuatorKind::Valve, "D6"),
        (12, 2, "Bomba sur", ActuatorKind::Pump, "D7"),
    ] {
        db.upsert_actuator(&Actuator {
            id,
            device_id,
            name: name.into(),
            kind,
            pin: pin.into(),
            state: ActuatorState::Off,
            active: true,
        })
        .await
        .unwrap();
    }

    db.upsert_calendar_entry(&CalendarEntry {
        id: 1,
        greenhouse_id: 1,
        user_id: None,
        day_of_week: "Lunes".into(),
        start_time: "08:00:00".into(),
        end_time: "08:30:00".into(),
        duration_minutes: None,
        start_date: None,
        end_date: None,
        active: true,
    })
    .await
    .unwrap();
}

/// Irrigation config 1: soil sensor 5 drives pump 10.
pub async fn add_config(db: &Db, mode: ConfigMode, lower: f64, upper: f64, duration_minutes: Option<i64>) {
    db.upsert_irrigation_config(&IrrigationConfig {
        id: 1,
        device_id: 1,
        name: "Riego tomates".into(),
        sensor_id: 5,
        actuator_id: 10,
        lower_threshold: lower,
        upper_threshold: upper,
        duration_minutes,
        mode,
        active: true,
    })
    .await
    .unwrap();
}

/// Everything already sent on a push subscription.
pub fn drain(rx: &mut broadcast::Receiver<PushEvent>) -> Vec<PushEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

// ---------------------------------------------------------------------------
// Recording seams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub message: String,
    pub severity: MailSeverity,
}

pub struct RecordingMailer {
    tx: mpsc::UnboundedSender<SentMail>,
}

impl RecordingMailer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SentMail>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_alert(&self, to: &str, subject: &str, message: &str, severity: MailSeverity) -> Result<()> {
        let _ = self.tx.send(SentMail {
            to: to.into(),
            subject: subject.into(),
            message: message.into(),
            severity,
        });
        Ok(())
    }
}

pub struct RecordingTransport {
    connected: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingTransport {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_publishes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("broker rejected publish");
        }
        let value = serde_json::from_slice(&payload)?;
        self.sent.lock().push((topic.to_string(), value));
        Ok(())
    }
}

pub struct StubAdvisory {
    allow: bool,
    calls: AtomicUsize,
}

impl StubAdvisory {
    pub fn new(allow: bool) -> Arc<Self> {
        Arc::new(Self {
            allow,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Advisory for StubAdvisory {
    async fn should_water(&self, _lat: f64, _lon: f64) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.allow
    }
}

// ---------------------------------------------------------------------------
// Wired services
// ---------------------------------------------------------------------------

pub struct Harness {
    pub db: Db,
    pub shared: SharedState,
    pub notifier: Notifier,
    pub transport: Arc<RecordingTransport>,
    pub mail: mpsc::UnboundedReceiver<SentMail>,
    pub dispatcher: Dispatcher,
}

pub async fn harness(connected: bool) -> Harness {
    let db = test_db().await;
    seed_basic(&db).await;

    let shared = test_shared();
    let (mailer, mail) = RecordingMailer::new();
    let notifier = Notifier::new(mailer, shared.clone());
    let transport = RecordingTransport::new(connected);
    let dispatcher = Dispatcher::new(db.clone(), transport.clone(), notifier.clone());

    Harness {
        db,
        shared,
        notifier,
        transport,
        mail,
        dispatcher,
    }
}

/// Mails sent so far, waiting briefly for the background senders.
pub async fn collect_mail(rx: &mut mpsc::UnboundedReceiver<SentMail>) -> Vec<SentMail> {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let mut out = Vec::new();
    while let Ok(m) = rx.try_recv() {
        out.push(m);
    }
    out
}
