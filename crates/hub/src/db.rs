use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Enumerations (stored as TEXT, spelled the way devices and the UI expect)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum SensorKind {
    #[serde(rename = "humedad_suelo")]
    #[sqlx(rename = "humedad_suelo")]
    SoilMoisture,
    #[serde(rename = "temperatura")]
    #[sqlx(rename = "temperatura")]
    Temperature,
    #[serde(rename = "humedad_ambiente")]
    #[sqlx(rename = "humedad_ambiente")]
    AirHumidity,
    #[serde(rename = "nivel_agua")]
    #[sqlx(rename = "nivel_agua")]
    WaterLevel,
    #[serde(rename = "lluvia")]
    #[sqlx(rename = "lluvia")]
    Rain,
    #[serde(rename = "luz")]
    #[sqlx(rename = "luz")]
    Light,
}

/// Defaults applied to a sensor the hub creates on first sight.
pub struct SensorDefaults {
    pub label: &'static str,
    pub unit: &'static str,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::SoilMoisture => "humedad_suelo",
            SensorKind::Temperature => "temperatura",
            SensorKind::AirHumidity => "humedad_ambiente",
            SensorKind::WaterLevel => "nivel_agua",
            SensorKind::Rain => "lluvia",
            SensorKind::Light => "luz",
        }
    }

    pub fn defaults(self) -> SensorDefaults {
        let (label, unit, min, max) = match self {
            SensorKind::SoilMoisture => ("Humedad suelo", "%", Some(20.0), Some(80.0)),
            SensorKind::Temperature => ("Temperatura", "°C", Some(5.0), Some(35.0)),
            SensorKind::AirHumidity => ("Humedad ambiente", "%", Some(30.0), Some(90.0)),
            SensorKind::WaterLevel => ("Nivel de agua", "%", Some(10.0), Some(100.0)),
            SensorKind::Rain => ("Lluvia", "mm", None, None),
            SensorKind::Light => ("Luz", "lux", None, None),
        };
        SensorDefaults { label, unit, min, max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ActuatorKind {
    #[serde(rename = "bomba")]
    #[sqlx(rename = "bomba")]
    Pump,
    #[serde(rename = "valvula")]
    #[sqlx(rename = "valvula")]
    Valve,
    #[serde(rename = "electrovalvula")]
    #[sqlx(rename = "electrovalvula")]
    SolenoidValve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ActuatorState {
    #[serde(rename = "encendido")]
    #[sqlx(rename = "encendido")]
    On,
    #[serde(rename = "apagado")]
    #[sqlx(rename = "apagado")]
    Off,
}

impl ActuatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActuatorState::On => "encendido",
            ActuatorState::Off => "apagado",
        }
    }

    /// Numeric form used in device commands.
    pub fn as_bit(self) -> u8 {
        match self {
            ActuatorState::On => 1,
            ActuatorState::Off => 0,
        }
    }
}

/// How an irrigation configuration reacts to its sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ConfigMode {
    /// Suggestion only: notify, never actuate.
    #[serde(rename = "manual")]
    #[sqlx(rename = "manual")]
    Suggest,
    #[serde(rename = "automatico")]
    #[sqlx(rename = "automatico")]
    Automatic,
}

/// What caused an actuator dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum TriggerMode {
    #[serde(rename = "manual")]
    #[sqlx(rename = "manual")]
    Manual,
    #[serde(rename = "automatico")]
    #[sqlx(rename = "automatico")]
    Automatic,
    #[serde(rename = "programado")]
    #[sqlx(rename = "programado")]
    Scheduled,
    #[serde(rename = "emergencia")]
    #[sqlx(rename = "emergencia")]
    Emergency,
}

impl TriggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMode::Manual => "manual",
            TriggerMode::Automatic => "automatico",
            TriggerMode::Scheduled => "programado",
            TriggerMode::Emergency => "emergencia",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum DeviceStatus {
    #[serde(rename = "activo")]
    #[sqlx(rename = "activo")]
    Active,
    #[serde(rename = "inactivo")]
    #[sqlx(rename = "inactivo")]
    Inactive,
    #[serde(rename = "mantenimiento")]
    #[sqlx(rename = "mantenimiento")]
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum AlertKind {
    #[serde(rename = "sensor_fuera_rango")]
    #[sqlx(rename = "sensor_fuera_rango")]
    OutOfRange,
    #[serde(rename = "sensor_desconectado")]
    #[sqlx(rename = "sensor_desconectado")]
    SensorDisconnected,
    #[serde(rename = "sensor_error")]
    #[sqlx(rename = "sensor_error")]
    SensorFault,
    #[serde(rename = "salud_planta")]
    #[sqlx(rename = "salud_planta")]
    PlantHealth,
    #[serde(rename = "dispositivo_offline")]
    #[sqlx(rename = "dispositivo_offline")]
    DeviceOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum Severity {
    #[serde(rename = "baja")]
    #[sqlx(rename = "baja")]
    Low,
    #[serde(rename = "media")]
    #[sqlx(rename = "media")]
    Medium,
    #[serde(rename = "alta")]
    #[sqlx(rename = "alta")]
    High,
    #[serde(rename = "critica")]
    #[sqlx(rename = "critica")]
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum IrrigationEventKind {
    #[serde(rename = "inicio_riego")]
    #[sqlx(rename = "inicio_riego")]
    Start,
    #[serde(rename = "fin_riego")]
    #[sqlx(rename = "fin_riego")]
    Stop,
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plant {
    pub id: i64,
    pub name: String,
    pub hum_min: Option<f64>,
    pub hum_max: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub user_id: Option<i64>,
    pub status: DeviceStatus,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Greenhouse {
    pub id: i64,
    pub description: String,
    pub plant_id: Option<i64>,
    pub device_id: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sensor {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub kind: SensorKind,
    pub pin: Option<String>,
    pub unit: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Actuator {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub kind: ActuatorKind,
    pub pin: String,
    pub state: ActuatorState,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IrrigationConfig {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub sensor_id: i64,
    pub actuator_id: i64,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    pub duration_minutes: Option<i64>,
    pub mode: ConfigMode,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CalendarEntry {
    pub id: i64,
    pub greenhouse_id: i64,
    pub user_id: Option<i64>,
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub active: bool,
}

/// A calendar entry joined with what the scheduler needs to act on it.
#[derive(Debug, Clone, FromRow)]
pub struct CalendarSlot {
    pub id: i64,
    pub greenhouse_id: i64,
    pub greenhouse: String,
    pub device_id: Option<i64>,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub owner_email: Option<String>,
}

#[cfg(test)]
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Reading {
    pub id: i64,
    pub sensor_id: i64,
    pub value: f64,
    pub ts: i64,
}

#[cfg(test)]
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Alert {
    pub id: i64,
    pub device_id: i64,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub read: bool,
    pub created_at: i64,
}

#[cfg(test)]
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct IrrigationEvent {
    pub id: i64,
    pub device_id: i64,
    pub actuator_id: i64,
    pub kind: IrrigationEventKind,
    pub mode: TriggerMode,
    pub detail: String,
    pub user_id: Option<i64>,
    pub created_at: i64,
    pub pending_off_at: Option<i64>,
}

/// A timed auto-off still owed to an actuator.
#[derive(Debug, Clone, FromRow)]
pub struct PendingOff {
    pub event_id: i64,
    pub device_id: i64,
    pub actuator_id: i64,
    pub mode: TriggerMode,
    pub pending_off_at: i64,
}

pub struct NewSensor<'a> {
    pub device_id: i64,
    pub kind: SensorKind,
    pub pin: &'a str,
    pub name: String,
    pub unit: &'a str,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

pub struct NewAlert<'a> {
    pub device_id: i64,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: &'a str,
    pub created_at: i64,
}

/// One actuator state change plus its audit record.
pub struct Transition {
    pub device_id: i64,
    pub actuator_id: i64,
    pub state: ActuatorState,
    pub mode: TriggerMode,
    pub user_id: Option<i64>,
    pub ts: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/riego/riego.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database lives and dies with its single connection.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Seeding (config file + tests)
    // ----------------------------

    pub async fn upsert_user(&self, u: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name=excluded.name, email=excluded.email
            "#,
        )
        .bind(u.id)
        .bind(&u.name)
        .bind(&u.email)
        .execute(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(())
    }

    pub async fn upsert_plant(&self, p: &Plant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plants (id, name, hum_min, hum_max, temp_min, temp_max)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              hum_min=excluded.hum_min, hum_max=excluded.hum_max,
              temp_min=excluded.temp_min, temp_max=excluded.temp_max
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(p.hum_min)
        .bind(p.hum_max)
        .bind(p.temp_min)
        .bind(p.temp_max)
        .execute(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(())
    }

    pub async fn upsert_device(&self, d: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (id, name, api_key, user_id, status, last_seen)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              api_key=excluded.api_key,
              user_id=excluded.user_id,
              status=excluded.status
            "#,
        )
        .bind(d.id)
        .bind(&d.name)
        .bind(&d.api_key)
        .bind(d.user_id)
        .bind(d.status)
        .bind(d.last_seen)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn upsert_greenhouse(&self, g: &Greenhouse) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO greenhouses (id, description, plant_id, device_id, latitude, longitude, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              description=excluded.description,
              plant_id=excluded.plant_id,
              device_id=excluded.device_id,
              latitude=excluded.latitude,
              longitude=excluded.longitude,
              active=excluded.active
            "#,
        )
        .bind(g.id)
        .bind(&g.description)
        .bind(g.plant_id)
        .bind(g.device_id)
        .bind(g.latitude)
        .bind(g.longitude)
        .bind(g.active)
        .execute(&self.pool)
        .await
        .context("upsert_greenhouse failed")?;
        Ok(())
    }

    pub async fn upsert_sensor(&self, s: &Sensor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (id, device_id, name, kind, pin, unit, min_value, max_value, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              device_id=excluded.device_id,
              name=excluded.name,
              kind=excluded.kind,
              pin=excluded.pin,
              unit=excluded.unit,
              min_value=excluded.min_value,
              max_value=excluded.max_value,
              active=excluded.active
            "#,
        )
        .bind(s.id)
        .bind(s.device_id)
        .bind(&s.name)
        .bind(s.kind)
        .bind(&s.pin)
        .bind(&s.unit)
        .bind(s.min_value)
        .bind(s.max_value)
        .bind(s.active)
        .bind(s.created_at)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn upsert_actuator(&self, a: &Actuator) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actuators (id, device_id, name, kind, pin, state, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              device_id=excluded.device_id,
              name=excluded.name,
              kind=excluded.kind,
              pin=excluded.pin,
              active=excluded.active
            "#,
        )
        .bind(a.id)
        .bind(a.device_id)
        .bind(&a.name)
        .bind(a.kind)
        .bind(&a.pin)
        .bind(a.state)
        .bind(a.active)
        .execute(&self.pool)
        .await
        .context("upsert_actuator failed")?;
        Ok(())
    }

    pub async fn upsert_irrigation_config(&self, c: &IrrigationConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_configs (
              id, device_id, name, sensor_id, actuator_id,
              lower_threshold, upper_threshold, duration_minutes, mode, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              device_id=excluded.device_id,
              name=excluded.name,
              sensor_id=excluded.sensor_id,
              actuator_id=excluded.actuator_id,
              lower_threshold=excluded.lower_threshold,
              upper_threshold=excluded.upper_threshold,
              duration_minutes=excluded.duration_minutes,
              mode=excluded.mode,
              active=excluded.active
            "#,
        )
        .bind(c.id)
        .bind(c.device_id)
        .bind(&c.name)
        .bind(c.sensor_id)
        .bind(c.actuator_id)
        .bind(c.lower_threshold)
        .bind(c.upper_threshold)
        .bind(c.duration_minutes)
        .bind(c.mode)
        .bind(c.active)
        .execute(&self.pool)
        .await
        .context("upsert_irrigation_config failed")?;
        Ok(())
    }

    pub async fn upsert_calendar_entry(&self, e: &CalendarEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calendar_entries (
              id, greenhouse_id, user_id, day_of_week, start_time, end_time,
              duration_minutes, start_date, end_date, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              greenhouse_id=excluded.greenhouse_id,
              user_id=excluded.user_id,
              day_of_week=excluded.day_of_week,
              start_time=excluded.start_time,
              end_time=excluded.end_time,
              duration_minutes=excluded.duration_minutes,
              start_date=excluded.start_date,
              end_date=excluded.end_date,
              active=excluded.active
            "#,
        )
        .bind(e.id)
        .bind(e.greenhouse_id)
        .bind(e.user_id)
        .bind(&e.day_of_week)
        .bind(&e.start_time)
        .bind(&e.end_time)
        .bind(e.duration_minutes)
        .bind(&e.start_date)
        .bind(&e.end_date)
        .bind(e.active)
        .execute(&self.pool)
        .await
        .context("upsert_calendar_entry failed")?;
        Ok(())
    }

    // ----------------------------
    // Devices + owners
    // ----------------------------

    pub async fn device_by_api_key(&self, api_key: &str) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(
            "SELECT id, name, api_key, user_id, status, last_seen FROM devices WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .context("device_by_api_key failed")
    }

    pub async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(
            "SELECT id, name, api_key, user_id, status, last_seen FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")
    }

    pub async fn devices_for_user(&self, user_id: i64) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(
            "SELECT id, name, api_key, user_id, status, last_seen FROM devices WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("devices_for_user failed")
    }

    pub async fn touch_device(&self, id: i64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touch_device failed")?;
        Ok(())
    }

    /// Devices marked active that have been heard from, but not since `cutoff`.
    pub async fn stale_active_devices(&self, cutoff: i64) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, name, api_key, user_id, status, last_seen
            FROM devices
            WHERE status = 'activo' AND last_seen IS NOT NULL AND last_seen < ?
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("stale_active_devices failed")
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT id, name, email FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_user failed")
    }

    // ----------------------------
    // Sensors + readings
    // ----------------------------

    const SENSOR_COLUMNS: &'static str =
        "id, device_id, name, kind, pin, unit, min_value, max_value, active, created_at";

    pub async fn get_sensor(&self, id: i64) -> Result<Option<Sensor>> {
        sqlx::query_as::<_, Sensor>(&format!(
            "SELECT {} FROM sensors WHERE id = ?",
            Self::SENSOR_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor failed")
    }

    pub async fn sensor_by_pin(&self, device_id: i64, pin: &str, kind: SensorKind) -> Result<Option<Sensor>> {
        sqlx::query_as::<_, Sensor>(&format!(
            "SELECT {} FROM sensors WHERE device_id = ? AND pin = ? AND kind = ?",
            Self::SENSOR_COLUMNS
        ))
        .bind(device_id)
        .bind(pin)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await
        .context("sensor_by_pin failed")
    }

    /// Insert-or-fetch on (device, pin, kind). Concurrent callers all get the
    /// same row; the unique index decides who actually inserted it.
    pub async fn provision_sensor(&self, s: &NewSensor<'_>, ts: i64) -> Result<Sensor> {
        sqlx::query(
            r#"
            INSERT INTO sensors (device_id, name, kind, pin, unit, min_value, max_value, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(device_id, pin, kind) DO NOTHING
            "#,
        )
        .bind(s.device_id)
        .bind(&s.name)
        .bind(s.kind)
        .bind(s.pin)
        .bind(s.unit)
        .bind(s.min_value)
        .bind(s.max_value)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("provision_sensor insert failed")?;

        self.sensor_by_pin(s.device_id, s.pin, s.kind)
            .await?
            .context("provisioned sensor vanished")
    }

    pub async fn sensors_for_device(&self, device_id: i64) -> Result<Vec<Sensor>> {
        sqlx::query_as::<_, Sensor>(&format!(
            "SELECT {} FROM sensors WHERE device_id = ? ORDER BY id",
            Self::SENSOR_COLUMNS
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("sensors_for_device failed")
    }

    pub async fn insert_reading(&self, sensor_id: i64, value: f64, ts: i64) -> Result<()> {
        sqlx::query("INSERT INTO readings (sensor_id, value, ts) VALUES (?, ?, ?)")
            .bind(sensor_id)
            .bind(value)
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn readings_for_sensor(&self, sensor_id: i64) -> Result<Vec<Reading>> {
        sqlx::query_as::<_, Reading>(
            "SELECT id, sensor_id, value, ts FROM readings WHERE sensor_id = ? ORDER BY id",
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await
        .context("readings_for_sensor failed")
    }

    // ----------------------------
    // Greenhouses + plants
    // ----------------------------

    pub async fn greenhouse_for_device(&self, device_id: i64) -> Result<Option<Greenhouse>> {
        sqlx::query_as::<_, Greenhouse>(
            r#"
            SELECT id, description, plant_id, device_id, latitude, longitude, active
            FROM greenhouses
            WHERE device_id = ? AND active = 1
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("greenhouse_for_device failed")
    }

    pub async fn get_plant(&self, id: i64) -> Result<Option<Plant>> {
        sqlx::query_as::<_, Plant>(
            "SELECT id, name, hum_min, hum_max, temp_min, temp_max FROM plants WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant failed")
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, a: &NewAlert<'_>) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO alerts (device_id, kind, severity, message, read, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(a.device_id)
        .bind(a.kind)
        .bind(a.severity)
        .bind(a.message)
        .bind(a.created_at)
        .execute(&self.pool)
        .await
        .context("insert_alert failed")?;
        Ok(res.last_insert_rowid())
    }

    /// True when the same message was already raised for the device since `since`.
    pub async fn alert_repeated_since(&self, device_id: i64, kind: AlertKind, message: &str, since: i64) -> Result<bool> {
        let hit: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM alerts
            WHERE device_id = ? AND kind = ? AND message = ? AND created_at >= ?
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(kind)
        .bind(message)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("alert_repeated_since failed")?;
        Ok(hit.is_some())
    }

    pub async fn unread_alert_since(&self, device_id: i64, kind: AlertKind, since: i64) -> Result<bool> {
        let hit: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM alerts
            WHERE device_id = ? AND kind = ? AND read = 0 AND created_at >= ?
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(kind)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("unread_alert_since failed")?;
        Ok(hit.is_some())
    }

    #[cfg(test)]
    pub async fn alerts_for_device(&self, device_id: i64) -> Result<Vec<Alert>> {
        sqlx::query_as::<_, Alert>(
            r#"
            SELECT id, device_id, kind, severity, message, read, created_at
            FROM alerts WHERE device_id = ? ORDER BY id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("alerts_for_device failed")
    }

    // ----------------------------
    // Actuators + irrigation configs
    // ----------------------------

    const ACTUATOR_COLUMNS: &'static str = "id, device_id, name, kind, pin, state, active";

    pub async fn get_actuator(&self, id: i64) -> Result<Option<Actuator>> {
        sqlx::query_as::<_, Actuator>(&format!(
            "SELECT {} FROM actuators WHERE id = ?",
            Self::ACTUATOR_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_actuator failed")
    }

    pub async fn actuators_for_device(&self, device_id: i64) -> Result<Vec<Actuator>> {
        sqlx::query_as::<_, Actuator>(&format!(
            "SELECT {} FROM actuators WHERE device_id = ? ORDER BY id",
            Self::ACTUATOR_COLUMNS
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("actuators_for_device failed")
    }

    pub async fn active_pump_for_device(&self, device_id: i64) -> Result<Option<Actuator>> {
        sqlx::query_as::<_, Actuator>(&format!(
            "SELECT {} FROM actuators WHERE device_id = ? AND kind = 'bomba' AND active = 1 ORDER BY id LIMIT 1",
            Self::ACTUATOR_COLUMNS
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("active_pump_for_device failed")
    }

    /// Active configurations driven by `sensor_id`, in both modes.
    pub async fn configs_for_sensor(&self, sensor_id: i64) -> Result<Vec<IrrigationConfig>> {
        sqlx::query_as::<_, IrrigationConfig>(
            r#"
            SELECT id, device_id, name, sensor_id, actuator_id,
                   lower_threshold, upper_threshold, duration_minutes, mode, active
            FROM irrigation_configs
            WHERE sensor_id = ? AND active = 1
            ORDER BY id
            "#,
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await
        .context("configs_for_sensor failed")
    }

    // ----------------------------
    // Calendar
    // ----------------------------

    pub async fn calendar_slots_for_day(&self, day_of_week: &str) -> Result<Vec<CalendarSlot>> {
        sqlx::query_as::<_, CalendarSlot>(
            r#"
            SELECT c.id, c.greenhouse_id, g.description AS greenhouse, g.device_id,
                   c.start_time, c.end_time, c.duration_minutes, c.start_date, c.end_date,
                   u.email AS owner_email
            FROM calendar_entries c
            JOIN greenhouses g ON g.id = c.greenhouse_id
            LEFT JOIN devices d ON d.id = g.device_id
            LEFT JOIN users u ON u.id = COALESCE(c.user_id, d.user_id)
            WHERE c.day_of_week = ? AND c.active = 1
            ORDER BY c.id
            "#,
        )
        .bind(day_of_week)
        .fetch_all(&self.pool)
        .await
        .context("calendar_slots_for_day failed")
    }

    #[cfg(test)]
    pub async fn get_calendar_entry(&self, id: i64) -> Result<Option<CalendarEntry>> {
        sqlx::query_as::<_, CalendarEntry>(
            r#"
            SELECT id, greenhouse_id, user_id, day_of_week, start_time, end_time,
                   duration_minutes, start_date, end_date, active
            FROM calendar_entries WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_calendar_entry failed")
    }

    /// Deactivates every active calendar entry of the greenhouses attached to
    /// the device. Returns the greenhouse ids touched and the entry count.
    pub async fn disable_calendar_for_device(&self, device_id: i64) -> Result<(Vec<i64>, u64)> {
        let greenhouses: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM greenhouses WHERE device_id = ? ORDER BY id")
                .bind(device_id)
                .fetch_all(&self.pool)
                .await
                .context("disable_calendar_for_device lookup failed")?;

        let res = sqlx::query(
            r#"
            UPDATE calendar_entries SET active = 0
            WHERE active = 1
              AND greenhouse_id IN (SELECT id FROM greenhouses WHERE device_id = ?)
            "#,
        )
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("disable_calendar_for_device failed")?;

        Ok((greenhouses, res.rows_affected()))
    }

    // ----------------------------
    // Actuator transitions + timed auto-off
    // ----------------------------

    /// Persists the new actuator state, drops any auto-off still owed to the
    /// actuator and appends the audit event, all in one transaction.
    pub async fn apply_transition(&self, t: &Transition) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("apply_transition begin failed")?;

        sqlx::query("UPDATE actuators SET state = ? WHERE id = ?")
            .bind(t.state)
            .bind(t.actuator_id)
            .execute(&mut *tx)
            .await
            .context("apply_transition state update failed")?;

        sqlx::query(
            "UPDATE irrigation_events SET pending_off_at = NULL WHERE actuator_id = ? AND pending_off_at IS NOT NULL",
        )
        .bind(t.actuator_id)
        .execute(&mut *tx)
        .await
        .context("apply_transition pending clear failed")?;

        let kind = match t.state {
            ActuatorState::On => IrrigationEventKind::Start,
            ActuatorState::Off => IrrigationEventKind::Stop,
        };
        let detail = format!("Riego {} {}", t.mode.as_str(), t.state.as_str());
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_events (device_id, actuator_id, kind, mode, detail, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(t.device_id)
        .bind(t.actuator_id)
        .bind(kind)
        .bind(t.mode)
        .bind(&detail)
        .bind(t.user_id)
        .bind(t.ts)
        .execute(&mut *tx)
        .await
        .context("apply_transition event insert failed")?;

        tx.commit().await.context("apply_transition commit failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn set_pending_off(&self, event_id: i64, deadline: i64) -> Result<()> {
        sqlx::query("UPDATE irrigation_events SET pending_off_at = ? WHERE id = ?")
            .bind(deadline)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .context("set_pending_off failed")?;
        Ok(())
    }

    /// Atomically takes ownership of a pending auto-off. Only one caller ever
    /// gets `true` for a given deadline.
    pub async fn claim_pending_off(&self, event_id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE irrigation_events SET pending_off_at = NULL WHERE id = ? AND pending_off_at IS NOT NULL",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("claim_pending_off failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn due_pending_offs(&self, now: i64) -> Result<Vec<PendingOff>> {
        sqlx::query_as::<_, PendingOff>(
            r#"
            SELECT id AS event_id, device_id, actuator_id, mode, pending_off_at
            FROM irrigation_events
            WHERE pending_off_at IS NOT NULL AND pending_off_at <= ?
            ORDER BY pending_off_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("due_pending_offs failed")
    }

    #[cfg(test)]
    pub async fn events_for_actuator(&self, actuator_id: i64) -> Result<Vec<IrrigationEvent>> {
        sqlx::query_as::<_, IrrigationEvent>(
            r#"
            SELECT id, device_id, actuator_id, kind, mode, detail, user_id, created_at, pending_off_at
            FROM irrigation_events WHERE actuator_id = ? ORDER BY id
            "#,
        )
        .bind(actuator_id)
        .fetch_all(&self.pool)
        .await
        .context("events_for_actuator failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
