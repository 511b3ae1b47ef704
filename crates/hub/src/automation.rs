//! Threshold rules: turns a fresh reading into irrigation decisions.
//!
//! Every active configuration driven by the sensor is evaluated on its own.
//! Automatic configurations dispatch directly (subject to the weather
//! advisory); suggestion configurations only nudge the operator, at most once
//! per actuator per [`SUGGESTION_WINDOW`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::cache::{AppCache, WindowGate};
use crate::db::{ActuatorState, ConfigMode, Db, Device, IrrigationConfig, Sensor, TriggerMode};
use crate::dispatch::Dispatcher;
use crate::notify::{Notifier, PushEvent};
use crate::state::SharedState;
use crate::weather::Advisory;

pub const SUGGESTION_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Where to ask about rain when a greenhouse has no coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// What one configuration decided for one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    None,
    Started,
    Stopped,
    Postponed,
    Suggested,
    Throttled,
    Skipped,
}

pub struct AutomationEngine {
    db: Db,
    cache: Arc<AppCache>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    advisory: Arc<dyn Advisory>,
    shared: SharedState,
    fallback: Coordinates,
    suggestions: WindowGate,
}

impl AutomationEngine {
    pub fn new(
        db: Db,
        cache: Arc<AppCache>,
        dispatcher: Dispatcher,
        notifier: Notifier,
        advisory: Arc<dyn Advisory>,
        shared: SharedState,
        fallback: Coordinates,
    ) -> Self {
        Self {
            db,
            cache,
            dispatcher,
            notifier,
            advisory,
            shared,
            fallback,
            suggestions: WindowGate::new("suggestions", SUGGESTION_WINDOW),
        }
    }

    /// Evaluates every active configuration for the reading taken at `now`
    /// (unix seconds). One failing configuration does not stop the others.
    pub async fn evaluate(&self, device: &Device, sensor: &Sensor, value: f64, now: i64) -> Result<Vec<Decision>> {
        let configs = self.configs_for(sensor.id).await?;

        let mut decisions = Vec::with_capacity(configs.len());
        for config in configs.iter().filter(|c| c.device_id == device.id) {
            let decision = match self.evaluate_one(device, sensor, config, value, now).await {
                Ok(d) => d,
                Err(e) => {
                    error!(device = %device.name, config_id = config.id, "automation failed: {e:#}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("{}: automation config {} failed: {e}", device.name, config.id));
                    Decision::Skipped
                }
            };
            decisions.push(decision);
        }
        Ok(decisions)
    }

    async fn configs_for(&self, sensor_id: i64) -> Result<Vec<IrrigationConfig>> {
        if let Some(hit) = self.cache.configs_for_sensor(sensor_id) {
            return Ok(hit);
        }
        let configs = self.db.configs_for_sensor(sensor_id).await?;
        self.cache.put_configs_for_sensor(sensor_id, configs.clone());
        Ok(configs)
    }

    async fn evaluate_one(
        &self,
        device: &Device,
        sensor: &Sensor,
        config: &IrrigationConfig,
        value: f64,
        now: i64,
    ) -> Result<Decision> {
        let Some(actuator) = self.db.get_actuator(config.actuator_id).await? else {
            warn!(config_id = config.id, actuator_id = config.actuator_id, "config points at a missing actuator");
            return Ok(Decision::Skipped);
        };
        if !actuator.active {
            warn!(config_id = config.id, actuator = %actuator.name, "config actuator is inactive");
            return Ok(Decision::Skipped);
        }

        let below = value < config.lower_threshold;
        let above = value > config.upper_threshold;

        match config.mode {
            ConfigMode::Automatic if below && actuator.state == ActuatorState::Off => {
                let here = self.coordinates_for(device.id).await?;
                if !self.advisory.should_water(here.lat, here.lon).await {
                    info!(
                        device = %device.name,
                        actuator = %actuator.name,
                        value,
                        "rain expected, automatic irrigation postponed"
                    );
                    self.shared.write().await.record_automation(format!(
                        "{}: riego de {} pospuesto por lluvia ({} {})",
                        device.name, actuator.name, value, sensor.unit
                    ));
                    return Ok(Decision::Postponed);
                }

                match config.duration_minutes.filter(|m| *m > 0) {
                    Some(minutes) => {
                        self.dispatcher
                            .start_timed(
                                device.id,
                                actuator.id,
                                TriggerMode::Automatic,
                                Duration::from_secs(minutes as u64 * 60),
                            )
                            .await?;
                    }
                    None => {
                        self.dispatcher
                            .control_actuator(device.id, actuator.id, ActuatorState::On, TriggerMode::Automatic, None)
                            .await?;
                    }
                }
                info!(device = %device.name, actuator = %actuator.name, value, "automatic irrigation started");
                Ok(Decision::Started)
            }

            ConfigMode::Automatic if above && actuator.state == ActuatorState::On => {
                self.dispatcher
                    .control_actuator(device.id, actuator.id, ActuatorState::Off, TriggerMode::Automatic, None)
                    .await?;
                info!(device = %device.name, actuator = %actuator.name, value, "automatic irrigation stopped");
                Ok(Decision::Stopped)
            }

            ConfigMode::Suggest if below && actuator.state == ActuatorState::Off => {
                let key = format!("{}:{}", device.id, actuator.id);
                if !self.suggestions.try_pass(&key, now) {
                    debug!(key = %key, "suggestion throttled");
                    return Ok(Decision::Throttled);
                }

                let message = format!(
                    "{}: {} {} por debajo del umbral ({}). Se sugiere regar con {}.",
                    sensor.name, value, sensor.unit, config.lower_threshold, actuator.name
                );
                self.notifier
                    .emit(PushEvent::IrrigationSuggested {
                        device_id: device.id,
                        actuator_id: actuator.id,
                        sensor_id: sensor.id,
                        config_id: config.id,
                        value,
                        lower_threshold: config.lower_threshold,
                        message,
                    })
                    .await;
                Ok(Decision::Suggested)
            }

            _ => Ok(Decision::None),
        }
    }

    async fn coordinates_for(&self, device_id: i64) -> Result<Coordinates> {
        let greenhouse = self.db.greenhouse_for_device(device_id).await?;
        Ok(match greenhouse.and_then(|g| g.latitude.zip(g.longitude)) {
            Some((lat, lon)) => Coordinates { lat, lon },
            None => self.fallback,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now_unix, Actuator, ActuatorKind, Greenhouse};
    use crate::state::EventKind;
    use crate::testkit::{add_config, drain, harness, Harness, StubAdvisory};

    const T0: i64 = 1_700_000_000;

    const SANTIAGO: Coordinates = Coordinates {
        lat: -33.4489,
        lon: -70.6693,
    };

    fn engine(h: &Harness, advisory: Arc<StubAdvisory>) -> AutomationEngine {
        AutomationEngine::new(
            h.db.clone(),
            Arc::new(AppCache::new()),
            h.dispatcher.clone(),
            h.notifier.clone(),
            advisory,
            h.shared.clone(),
            SANTIAGO,
        )
    }

    async fn subjects(h: &Harness) -> (Device, Sensor) {
        (
            h.db.get_device(1).await.unwrap().unwrap(),
            h.db.get_sensor(5).await.unwrap().unwrap(),
        )
    }

    // -- Automatic ----------------------------------------------------------

    #[tokio::test]
    async fn automatic_starts_below_lower_threshold() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, None).await;
        let advisory = StubAdvisory::new(true);
        let engine = engine(&h, advisory.clone());
        let (device, sensor) = subjects(&h).await;

        let decisions = engine.evaluate(&device, &sensor, 15.0, T0).await.unwrap();

        assert_eq!(decisions, vec![Decision::Started]);
        assert_eq!(advisory.calls(), 1);
        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::On);
        let ev = h.db.events_for_actuator(10).await.unwrap();
        assert_eq!(ev[0].mode, TriggerMode::Automatic);
        assert!(ev[0].pending_off_at.is_none());
    }

    #[tokio::test]
    async fn automatic_with_duration_schedules_off() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, Some(5)).await;
        let engine = engine(&h, StubAdvisory::new(true));
        let (device, sensor) = subjects(&h).await;
        let before = now_unix();

        engine.evaluate(&device, &sensor, 15.0, T0).await.unwrap();

        let ev = h.db.events_for_actuator(10).await.unwrap();
        let deadline = ev[0].pending_off_at.unwrap();
        assert!(deadline >= before + 300 && deadline <= now_unix() + 300);
    }

    #[tokio::test]
    async fn rain_postpones_automatic_start() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, None).await;
        let engine = engine(&h, StubAdvisory::new(false));
        let (device, sensor) = subjects(&h).await;

        let decisions = engine.evaluate(&device, &sensor, 15.0, T0).await.unwrap();

        assert_eq!(decisions, vec![Decision::Postponed]);
        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::Off);
        assert!(h.db.events_for_actuator(10).await.unwrap().is_empty());
        assert_eq!(h.shared.read().await.events_of(EventKind::Automation).count(), 1);
    }

    #[tokio::test]
    async fn automatic_stops_above_upper_threshold() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, None).await;
        h.dispatcher
            .control_actuator(1, 10, ActuatorState::On, TriggerMode::Manual, None)
            .await
            .unwrap();
        let advisory = StubAdvisory::new(true);
        let engine = engine(&h, advisory.clone());
        let (device, sensor) = subjects(&h).await;

        let decisions = engine.evaluate(&device, &sensor, 65.0, T0).await.unwrap();

        assert_eq!(decisions, vec![Decision::Stopped]);
        assert_eq!(advisory.calls(), 0);
        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::Off);
    }

    #[tokio::test]
    async fn in_band_value_does_nothing() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, None).await;
        let engine = engine(&h, StubAdvisory::new(true));
        let (device, sensor) = subjects(&h).await;

        assert_eq!(engine.evaluate(&device, &sensor, 40.0, T0).await.unwrap(), vec![Decision::None]);
        // already on and still dry: no second start
        h.dispatcher
            .control_actuator(1, 10, ActuatorState::On, TriggerMode::Manual, None)
            .await
            .unwrap();
        assert_eq!(engine.evaluate(&device, &sensor, 10.0, T0).await.unwrap(), vec![Decision::None]);
    }

    #[tokio::test]
    async fn greenhouse_coordinates_are_preferred() {
        let h = harness(true).await;
        h.db.upsert_greenhouse(&Greenhouse {
            id: 1,
            description: "Invernadero Norte".into(),
            plant_id: Some(1),
            device_id: Some(1),
            latitude: Some(-36.8),
            longitude: Some(-73.05),
            active: true,
        })
        .await
        .unwrap();
        let engine = engine(&h, StubAdvisory::new(true));

        let here = engine.coordinates_for(1).await.unwrap();
        assert_eq!(here, Coordinates { lat: -36.8, lon: -73.05 });
        assert_eq!(engine.coordinates_for(2).await.unwrap(), SANTIAGO);
    }

    // -- Suggestion ---------------------------------------------------------

    #[tokio::test]
    async fn suggestion_is_throttled_per_actuator() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Suggest, 20.0, 60.0, None).await;
        let mut rx = h.notifier.subscribe();
        let engine = engine(&h, StubAdvisory::new(true));
        let (device, sensor) = subjects(&h).await;

        assert_eq!(engine.evaluate(&device, &sensor, 15.0, T0).await.unwrap(), vec![Decision::Suggested]);
        assert_eq!(engine.evaluate(&device, &sensor, 14.0, T0).await.unwrap(), vec![Decision::Throttled]);

        let suggested: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "alert:riego_sugerido")
            .collect();
        assert_eq!(suggested.len(), 1);
        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::Off);
    }

    #[tokio::test]
    async fn suggestion_window_reopens() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Suggest, 20.0, 60.0, None).await;
        let mut rx = h.notifier.subscribe();
        let engine = engine(&h, StubAdvisory::new(true));
        let (device, sensor) = subjects(&h).await;
        let window = SUGGESTION_WINDOW.as_secs() as i64;

        assert_eq!(engine.evaluate(&device, &sensor, 15.0, T0).await.unwrap(), vec![Decision::Suggested]);
        assert_eq!(engine.evaluate(&device, &sensor, 15.0, T0 + 60).await.unwrap(), vec![Decision::Throttled]);
        assert_eq!(
            engine.evaluate(&device, &sensor, 15.0, T0 + window - 1).await.unwrap(),
            vec![Decision::Throttled]
        );
        assert_eq!(
            engine.evaluate(&device, &sensor, 15.0, T0 + window + 1).await.unwrap(),
            vec![Decision::Suggested]
        );

        let suggested = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "alert:riego_sugerido")
            .count();
        assert_eq!(suggested, 2);
    }

    // -- Skips --------------------------------------------------------------

    #[tokio::test]
    async fn inactive_actuator_is_skipped() {
        let h = harness(true).await;
        add_config(&h.db, ConfigMode::Automatic, 20.0, 60.0, None).await;
        h.db.upsert_actuator(&Actuator {
            id: 10,
            device_id: 1,
            name: "Bomba principal".into(),
            kind: ActuatorKind::Pump,
            pin: "D5".into(),
            state: ActuatorState::Off,
            active: false,
        })
        .await
        .unwrap();
        let engine = engine(&h, StubAdvisory::new(true));
        let (device, sensor) = subjects(&h).await;

        assert_eq!(engine.evaluate(&device, &sensor, 5.0, T0).await.unwrap(), vec![Decision::Skipped]);
        assert!(h.db.events_for_actuator(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sensor_without_configs_yields_nothing() {
        let h = harness(true).await;
        let engine = engine(&h, StubAdvisory::new(true));
        let (device, sensor) = subjects(&h).await;
        assert!(engine.evaluate(&device, &sensor, 5.0, T0).await.unwrap().is_empty());
    }
}
