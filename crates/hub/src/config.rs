//! Runtime settings from the environment, plus the optional TOML seed file
//! describing the deployment (users, plants, devices, greenhouses, sensors,
//! actuators, irrigation configs and calendar entries).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::automation::Coordinates;
use crate::cache::AppCache;
use crate::db::{
    Actuator, ActuatorKind, ActuatorState, CalendarEntry, ConfigMode, Db, Device, DeviceStatus, Greenhouse,
    IrrigationConfig, Plant, Sensor, SensorKind, User,
};
use crate::notify::MailSettings;
use crate::scheduler::{DAY_NAMES, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_TICK};
use crate::weather::WeatherSettings;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub db_url: String,
    pub config_path: Option<String>,
    pub web_port: u16,
    pub weather: WeatherSettings,
    pub default_coordinates: Coordinates,
    pub mail: MailSettings,
    pub tick: Duration,
    pub heartbeat_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut errors: Vec<String> = Vec::new();

        fn parsed<T: FromStr>(
            get: &impl Fn(&str) -> Option<String>,
            errors: &mut Vec<String>,
            key: &str,
            default: T,
        ) -> T {
            match get(key) {
                None => default,
                Some(raw) => match raw.trim().parse() {
                    Ok(v) => v,
                    Err(_) => {
                        errors.push(format!("{key}: cannot parse {raw:?}"));
                        default
                    }
                },
            }
        }

        let mqtt_port = parsed(&get, &mut errors, "MQTT_PORT", 1883u16);
        let web_port = parsed(&get, &mut errors, "WEB_PORT", 8080u16);
        let lat = parsed(&get, &mut errors, "WEATHER_LAT", -33.4489f64);
        let lon = parsed(&get, &mut errors, "WEATHER_LON", -70.6693f64);
        let tick_sec = parsed(&get, &mut errors, "SCHEDULER_TICK_SEC", DEFAULT_TICK.as_secs());
        let heartbeat_min = parsed(
            &get,
            &mut errors,
            "HEARTBEAT_TIMEOUT_MIN",
            DEFAULT_HEARTBEAT_TIMEOUT.as_secs() / 60,
        );

        if tick_sec == 0 {
            errors.push("SCHEDULER_TICK_SEC must be positive".into());
        }
        if heartbeat_min == 0 {
            errors.push("HEARTBEAT_TIMEOUT_MIN must be positive".into());
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            errors.push(format!("WEATHER_LAT/WEATHER_LON ({lat}, {lon}) out of range"));
        }

        if !errors.is_empty() {
            bail!(
                "invalid environment ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }

        Ok(Self {
            mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port,
            mqtt_username: get("MQTT_USERNAME"),
            mqtt_password: get("MQTT_PASSWORD"),
            db_url: get("DB_URL").unwrap_or_else(|| "sqlite:riego.db?mode=rwc".to_string()),
            config_path: get("CONFIG_PATH"),
            web_port,
            weather: WeatherSettings {
                api_key: get("OPENWEATHER_API_KEY"),
                base_url: get("WEATHER_BASE_URL")
                    .unwrap_or_else(|| "https://api.openweathermap.org/data/2.5".to_string()),
            },
            default_coordinates: Coordinates { lat, lon },
            mail: MailSettings {
                api_key: get("BREVO_API_KEY"),
                sender_email: get("BREVO_SENDER_EMAIL").unwrap_or_else(|| "alerta@tusistema.com".to_string()),
                app_url: get("APP_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            },
            tick: Duration::from_secs(tick_sec),
            heartbeat_timeout: Duration::from_secs(heartbeat_min * 60),
        })
    }
}

// ---------------------------------------------------------------------------
// Seed file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub greenhouses: Vec<GreenhouseEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub actuators: Vec<ActuatorEntry>,
    #[serde(default)]
    pub irrigation_configs: Vec<IrrigationEntry>,
    #[serde(default)]
    pub calendar: Vec<CalendarItem>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub id: i64,
    pub name: String,
    pub hum_min: Option<f64>,
    pub hum_max: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub user_id: Option<i64>,
    pub status: Option<DeviceStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreenhouseEntry {
    pub id: i64,
    pub description: String,
    pub plant_id: Option<i64>,
    pub device_id: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default = "yes")]
    pub active: bool,
}

/// Unset name, unit and bounds fall back to the kind's defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub id: i64,
    pub device_id: i64,
    pub kind: SensorKind,
    pub pin: Option<String>,
    pub name: Option<String>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorEntry {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub kind: ActuatorKind,
    pub pin: String,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrrigationEntry {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub sensor_id: i64,
    pub actuator_id: i64,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    pub duration_minutes: Option<i64>,
    pub mode: ConfigMode,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarItem {
    pub id: i64,
    pub greenhouse_id: i64,
    pub user_id: Option<i64>,
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default = "yes")]
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// "HH:MM" or "HH:MM:SS", 24 h.
fn valid_time(s: &str) -> bool {
    chrono::NaiveTime::parse_from_str(s, "%H:%M").is_ok() || chrono::NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok()
}

fn valid_date(s: &str) -> bool {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn check_ids(section: &str, ids: impl Iterator<Item = i64>, errors: &mut Vec<String>) -> HashSet<i64> {
    let mut seen = HashSet::new();
    for id in ids {
        if id <= 0 {
            errors.push(format!("{section} {id}: id must be positive"));
        } else if !seen.insert(id) {
            errors.push(format!("{section} {id}: duplicate id"));
        }
    }
    seen
}

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let users = check_ids("user", self.users.iter().map(|u| u.id), &mut errors);
        let plants = check_ids("plant", self.plants.iter().map(|p| p.id), &mut errors);
        let devices = check_ids("device", self.devices.iter().map(|d| d.id), &mut errors);
        let greenhouses = check_ids("greenhouse", self.greenhouses.iter().map(|g| g.id), &mut errors);
        check_ids("sensor", self.sensors.iter().map(|s| s.id), &mut errors);
        check_ids("actuator", self.actuators.iter().map(|a| a.id), &mut errors);
        check_ids("irrigation config", self.irrigation_configs.iter().map(|c| c.id), &mut errors);
        check_ids("calendar entry", self.calendar.iter().map(|c| c.id), &mut errors);

        self.validate_people_and_places(&users, &plants, &devices, &mut errors);
        self.validate_hardware(&devices, &mut errors);
        self.validate_irrigation(&mut errors);
        self.validate_calendar(&users, &greenhouses, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_people_and_places(
        &self,
        users: &HashSet<i64>,
        plants: &HashSet<i64>,
        devices: &HashSet<i64>,
        errors: &mut Vec<String>,
    ) {
        for u in &self.users {
            if u.name.trim().is_empty() {
                errors.push(format!("user {}: name is empty", u.id));
            }
            if u.email.as_deref().is_some_and(|e| !e.contains('@')) {
                errors.push(format!("user {}: email is not an address", u.id));
            }
        }

        for p in &self.plants {
            if p.name.trim().is_empty() {
                errors.push(format!("plant {}: name is empty", p.id));
            }
            if let (Some(lo), Some(hi)) = (p.hum_min, p.hum_max) {
                if lo >= hi {
                    errors.push(format!("plant {}: hum_min ({lo}) must be below hum_max ({hi})", p.id));
                }
            }
            if let (Some(lo), Some(hi)) = (p.temp_min, p.temp_max) {
                if lo >= hi {
                    errors.push(format!("plant {}: temp_min ({lo}) must be below temp_max ({hi})", p.id));
                }
            }
        }

        let mut keys: HashSet<&str> = HashSet::new();
        for d in &self.devices {
            if d.name.trim().is_empty() {
                errors.push(format!("device {}: name is empty", d.id));
            }
            if d.api_key.trim().is_empty() {
                errors.push(format!("device {}: api_key is empty", d.id));
            } else if d.api_key.contains(['/', '+', '#']) {
                errors.push(format!("device {}: api_key must not contain '/', '+' or '#'", d.id));
            } else if !keys.insert(&d.api_key) {
                errors.push(format!("device {}: api_key already used by another device", d.id));
            }
            if let Some(u) = d.user_id.filter(|u| !users.contains(u)) {
                errors.push(format!("device {}: user_id {u} does not match any defined user", d.id));
            }
        }

        for g in &self.greenhouses {
            if g.description.trim().is_empty() {
                errors.push(format!("greenhouse {}: description is empty", g.id));
            }
            if let Some(p) = g.plant_id.filter(|p| !plants.contains(p)) {
                errors.push(format!("greenhouse {}: plant_id {p} does not match any defined plant", g.id));
            }
            if let Some(d) = g.device_id.filter(|d| !devices.contains(d)) {
                errors.push(format!("greenhouse {}: device_id {d} does not match any defined device", g.id));
            }
            if g.latitude.is_some() != g.longitude.is_some() {
                errors.push(format!("greenhouse {}: latitude and longitude go together", g.id));
            }
        }
    }

    fn validate_hardware(&self, devices: &HashSet<i64>, errors: &mut Vec<String>) {
        let mut sensor_slots: HashSet<(i64, &str, SensorKind)> = HashSet::new();
        for s in &self.sensors {
            if !devices.contains(&s.device_id) {
                errors.push(format!(
                    "sensor {}: device_id {} does not match any defined device",
                    s.id, s.device_id
                ));
            }
            if let Some(pin) = s.pin.as_deref() {
                if pin.trim().is_empty() {
                    errors.push(format!("sensor {}: pin is empty", s.id));
                } else if !sensor_slots.insert((s.device_id, pin, s.kind)) {
                    errors.push(format!(
                        "sensor {}: pin {pin} already has a {} sensor on device {}",
                        s.id,
                        s.kind.as_str(),
                        s.device_id
                    ));
                }
            }
            if let (Some(lo), Some(hi)) = (s.min_value, s.max_value) {
                if lo >= hi {
                    errors.push(format!("sensor {}: min_value ({lo}) must be below max_value ({hi})", s.id));
                }
            }
        }

        let mut actuator_pins: HashSet<(i64, &str)> = HashSet::new();
        for a in &self.actuators {
            if !devices.contains(&a.device_id) {
                errors.push(format!(
                    "actuator {}: device_id {} does not match any defined device",
                    a.id, a.device_id
                ));
            }
            if a.name.trim().is_empty() {
                errors.push(format!("actuator {}: name is empty", a.id));
            }
            if a.pin.trim().is_empty() {
                errors.push(format!("actuator {}: pin is empty", a.id));
            } else if !actuator_pins.insert((a.device_id, a.pin.as_str())) {
                errors.push(format!(
                    "actuator {}: pin {} is already used on device {}",
                    a.id, a.pin, a.device_id
                ));
            }
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        for c in &self.irrigation_configs {
            match self.sensors.iter().find(|s| s.id == c.sensor_id) {
                None => errors.push(format!(
                    "irrigation config {}: sensor_id {} does not match any defined sensor",
                    c.id, c.sensor_id
                )),
                Some(s) if s.device_id != c.device_id => errors.push(format!(
                    "irrigation config {}: sensor {} is not on device {}",
                    c.id, c.sensor_id, c.device_id
                )),
                Some(_) => {}
            }
            match self.actuators.iter().find(|a| a.id == c.actuator_id) {
                None => errors.push(format!(
                    "irrigation config {}: actuator_id {} does not match any defined actuator",
                    c.id, c.actuator_id
                )),
                Some(a) if a.device_id != c.device_id => errors.push(format!(
                    "irrigation config {}: actuator {} is not on device {}",
                    c.id, c.actuator_id, c.device_id
                )),
                Some(_) => {}
            }
            if c.lower_threshold >= c.upper_threshold {
                errors.push(format!(
                    "irrigation config {}: lower_threshold ({}) must be below upper_threshold ({})",
                    c.id, c.lower_threshold, c.upper_threshold
                ));
            }
            if c.duration_minutes.is_some_and(|m| m <= 0) {
                errors.push(format!("irrigation config {}: duration_minutes must be positive", c.id));
            }
        }
    }

    fn validate_calendar(&self, users: &HashSet<i64>, greenhouses: &HashSet<i64>, errors: &mut Vec<String>) {
        for e in &self.calendar {
            if !greenhouses.contains(&e.greenhouse_id) {
                errors.push(format!(
                    "calendar entry {}: greenhouse_id {} does not match any defined greenhouse",
                    e.id, e.greenhouse_id
                ));
            }
            if let Some(u) = e.user_id.filter(|u| !users.contains(u)) {
                errors.push(format!("calendar entry {}: user_id {u} does not match any defined user", e.id));
            }
            if !DAY_NAMES.contains(&e.day_of_week.as_str()) {
                errors.push(format!(
                    "calendar entry {}: day_of_week {:?} is not one of {}",
                    e.id,
                    e.day_of_week,
                    DAY_NAMES.join(", ")
                ));
            }
            for (field, value) in [("start_time", &e.start_time), ("end_time", &e.end_time)] {
                if !valid_time(value) {
                    errors.push(format!("calendar entry {}: {field} {value:?} is not HH:MM", e.id));
                }
            }
            if valid_time(&e.start_time) && valid_time(&e.end_time) && e.start_time >= e.end_time {
                errors.push(format!("calendar entry {}: start_time must be before end_time", e.id));
            }
            for (field, value) in [("start_date", &e.start_date), ("end_date", &e.end_date)] {
                if let Some(v) = value.as_deref().filter(|v| !valid_date(v)) {
                    errors.push(format!("calendar entry {}: {field} {v:?} is not YYYY-MM-DD", e.id));
                }
            }
            if e.duration_minutes.is_some_and(|m| m <= 0) {
                errors.push(format!("calendar entry {}: duration_minutes must be positive", e.id));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML seed file.
pub fn load(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config = toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every seed entry, parents before children.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for u in &config.users {
        db.upsert_user(&User {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert user {}", u.id))?;
    }

    for p in &config.plants {
        db.upsert_plant(&Plant {
            id: p.id,
            name: p.name.clone(),
            hum_min: p.hum_min,
            hum_max: p.hum_max,
            temp_min: p.temp_min,
            temp_max: p.temp_max,
        })
        .await
        .with_context(|| format!("failed to upsert plant {}", p.id))?;
    }

    for d in &config.devices {
        db.upsert_device(&Device {
            id: d.id,
            name: d.name.clone(),
            api_key: d.api_key.clone(),
            user_id: d.user_id,
            status: d.status.unwrap_or(DeviceStatus::Active),
            last_seen: None,
        })
        .await
        .with_context(|| format!("failed to upsert device {}", d.id))?;
    }

    for g in &config.greenhouses {
        db.upsert_greenhouse(&Greenhouse {
            id: g.id,
            description: g.description.clone(),
            plant_id: g.plant_id,
            device_id: g.device_id,
            latitude: g.latitude,
            longitude: g.longitude,
            active: g.active,
        })
        .await
        .with_context(|| format!("failed to upsert greenhouse {}", g.id))?;
    }

    let now = crate::db::now_unix();
    for s in &config.sensors {
        let defaults = s.kind.defaults();
        let name = s.name.clone().unwrap_or_else(|| match s.pin.as_deref() {
            Some(pin) => format!("{} {}", defaults.label, pin),
            None => defaults.label.to_string(),
        });
        db.upsert_sensor(&Sensor {
            id: s.id,
            device_id: s.device_id,
            name,
            kind: s.kind,
            pin: s.pin.clone(),
            unit: s.unit.clone().unwrap_or_else(|| defaults.unit.to_string()),
            min_value: s.min_value.or(defaults.min),
            max_value: s.max_value.or(defaults.max),
            active: s.active,
            created_at: now,
        })
        .await
        .with_context(|| format!("failed to upsert sensor {}", s.id))?;
    }

    for a in &config.actuators {
        db.upsert_actuator(&Actuator {
            id: a.id,
            device_id: a.device_id,
            name: a.name.clone(),
            kind: a.kind,
            pin: a.pin.clone(),
            state: ActuatorState::Off,
            active: a.active,
        })
        .await
        .with_context(|| format!("failed to upsert actuator {}", a.id))?;
    }

    for c in &config.irrigation_configs {
        db.upsert_irrigation_config(&IrrigationConfig {
            id: c.id,
            device_id: c.device_id,
            name: c.name.clone(),
            sensor_id: c.sensor_id,
            actuator_id: c.actuator_id,
            lower_threshold: c.lower_threshold,
            upper_threshold: c.upper_threshold,
            duration_minutes: c.duration_minutes,
            mode: c.mode,
            active: c.active,
        })
        .await
        .with_context(|| format!("failed to upsert irrigation config {}", c.id))?;
    }

    for e in &config.calendar {
        db.upsert_calendar_entry(&CalendarEntry {
            id: e.id,
            greenhouse_id: e.greenhouse_id,
            user_id: e.user_id,
            day_of_week: e.day_of_week.clone(),
            start_time: e.start_time.clone(),
            end_time: e.end_time.clone(),
            duration_minutes: e.duration_minutes,
            start_date: e.start_date.clone(),
            end_date: e.end_date.clone(),
            active: e.active,
        })
        .await
        .with_context(|| format!("failed to upsert calendar entry {}", e.id))?;
    }

    tracing::info!(
        users = config.users.len(),
        devices = config.devices.len(),
        greenhouses = config.greenhouses.len(),
        sensors = config.sensors.len(),
        actuators = config.actuators.len(),
        irrigation_configs = config.irrigation_configs.len(),
        calendar = config.calendar.len(),
        "config applied"
    );

    Ok(())
}

/// Re-reads the seed file into a running hub and drops every cached row the
/// file touched. Devices and sensors are looked up before the upsert so that
/// entries cached under an old api key or on an old device go too.
pub async fn reload(path: &str, db: &Db, cache: &AppCache) -> Result<()> {
    let config = load(path)?;

    let mut previous_devices = Vec::new();
    for d in &config.devices {
        if let Some(old) = db.get_device(d.id).await? {
            previous_devices.push(old);
        }
    }
    let mut previous_sensors = Vec::new();
    for s in &config.sensors {
        if let Some(old) = db.get_sensor(s.id).await? {
            previous_sensors.push(old);
        }
    }

    apply(&config, db).await?;

    for old in &previous_devices {
        cache.invalidate_device(old.id, &old.api_key);
        if let Some(user_id) = old.user_id {
            cache.invalidate_user(user_id);
        }
    }
    for d in &config.devices {
        cache.invalidate_device(d.id, &d.api_key);
        if let Some(user_id) = d.user_id {
            cache.invalidate_user(user_id);
        }
    }
    for u in &config.users {
        cache.invalidate_user(u.id);
    }
    for old in &previous_sensors {
        cache.invalidate_device_sensors(old.device_id);
    }
    for s in &config.sensors {
        cache.invalidate_sensor(s.id);
        cache.invalidate_device_sensors(s.device_id);
    }
    for c in &config.irrigation_configs {
        cache.invalidate_configs_for_sensor(c.sensor_id);
    }

    tracing::info!(path, "config reloaded");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
