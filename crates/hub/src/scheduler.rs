//! Watering scheduler: a periodic tick with three independent duties.
//!
//! - **Calendar**: fire every active entry whose day and `HH:MM` match the
//!   current local time exactly. Missed minutes are not caught up. A fired
//!   `(entry, minute)` key is remembered for [`FIRED_RETENTION`] so one minute
//!   never fires twice.
//! - **Heartbeat**: flag active devices that have gone quiet for longer than
//!   the heartbeat timeout.
//! - **Recovery**: execute persisted auto-off deadlines that are due, so a
//!   restart never leaves a pump running.
//!
//! Each duty and each tick is isolated: a failure (or panic) is logged and
//! the next tick runs normally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Weekday};
use tracing::{debug, error, info, warn};

use crate::cache::WindowGate;
use crate::db::{AlertKind, CalendarSlot, Db, NewAlert, Severity, TriggerMode};
use crate::dispatch::Dispatcher;
use crate::notify::{MailSeverity, Notifier, PushEvent};
use crate::state::SharedState;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long a fired (entry, minute) key is remembered.
const FIRED_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

/// An unread offline alert younger than this suppresses a new one.
const OFFLINE_DEDUP_SECS: i64 = 60 * 60;

/// Run time for calendar entries that do not say.
const DEFAULT_RUN_MINUTES: i64 = 10;

pub const DAY_NAMES: [&str; 7] = ["Domingo", "Lunes", "Martes", "Miércoles", "Jueves", "Viernes", "Sábado"];

pub fn day_name(day: Weekday) -> &'static str {
    DAY_NAMES[day.num_days_from_sunday() as usize]
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    let date = raw.get(..10).unwrap_or(raw);
    match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(raw, "unparseable calendar date ignored: {e}");
            None
        }
    }
}

/// Whether `today` falls inside the entry's optional date bounds.
fn in_season(slot: &CalendarSlot, today: NaiveDate) -> bool {
    let after_start = parse_date(slot.start_date.as_deref()).map_or(true, |start| today >= start);
    let before_end = parse_date(slot.end_date.as_deref()).map_or(true, |end| today <= end);
    after_start && before_end
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub offline: usize,
    pub finished: usize,
}

pub struct WateringScheduler {
    db: Db,
    dispatcher: Dispatcher,
    notifier: Notifier,
    shared: SharedState,
    fired: WindowGate,
    tick_every: Duration,
    heartbeat_timeout: Duration,
}

impl WateringScheduler {
    pub fn new(
        db: Db,
        dispatcher: Dispatcher,
        notifier: Notifier,
        shared: SharedState,
        tick_every: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            notifier,
            shared,
            fired: WindowGate::new("calendar-fired", FIRED_RETENTION),
            tick_every,
            heartbeat_timeout,
        }
    }

    /// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick_every);

        info!(
            tick_sec = self.tick_every.as_secs(),
            heartbeat_timeout_sec = self.heartbeat_timeout.as_secs(),
            "scheduler started"
        );
        self.shared.write().await.record_scheduler(format!(
            "scheduler started (tick {}s, heartbeat timeout {}s)",
            self.tick_every.as_secs(),
            self.heartbeat_timeout.as_secs()
        ));

        loop {
            ticker.tick().await;

            // A panicking tick must not take the loop down with it.
            let this = Arc::clone(&self);
            let tick = tokio::spawn(async move { this.tick(Local::now()).await });
            match tick.await {
                Ok(report) if report != TickReport::default() => {
                    debug!(?report, "scheduler tick");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("scheduler tick aborted: {e}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("scheduler tick aborted: {e}"));
                }
            }
        }
    }

    pub async fn tick(&self, now: DateTime<Local>) -> TickReport {
        let now_ts = now.timestamp();
        let mut report = TickReport::default();

        match self.evaluate_calendar(now.naive_local(), now_ts).await {
            Ok(n) => report.fired = n,
            Err(e) => error!("calendar evaluation failed: {e:#}"),
        }
        match self.check_heartbeats(now_ts).await {
            Ok(n) => report.offline = n,
            Err(e) => error!("heartbeat check failed: {e:#}"),
        }
        match self.dispatcher.run_due_offs(now_ts).await {
            Ok(n) => report.finished = n,
            Err(e) => error!("auto-off recovery failed: {e:#}"),
        }
        report
    }

    // -----------------------------------------------------------------------
    // Calendar
    // -----------------------------------------------------------------------

    /// `local` is wall-clock time in the deployment's zone; `now_ts` is the
    /// same instant in unix seconds.
    pub async fn evaluate_calendar(&self, local: NaiveDateTime, now_ts: i64) -> Result<usize> {
        let day = day_name(local.weekday());
        let hhmm = local.format("%H:%M").to_string();
        let today = local.date();

        let slots = self.db.calendar_slots_for_day(day).await?;
        let mut fired = 0;
        for slot in &slots {
            if !in_season(slot, today) {
                continue;
            }
            if slot.start_time.get(..5) != Some(hhmm.as_str()) {
                continue;
            }
            if !self.fired.try_pass(&format!("{}:{hhmm}", slot.id), now_ts) {
                debug!(entry_id = slot.id, %hhmm, "calendar entry already fired this minute");
                continue;
            }

            match self.fire(slot).await {
                Ok(()) => fired += 1,
                Err(e) => {
                    error!(entry_id = slot.id, greenhouse = %slot.greenhouse, "calendar entry failed: {e:#}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("calendar entry {} failed: {e}", slot.id));
                }
            }
        }
        Ok(fired)
    }

    async fn fire(&self, slot: &CalendarSlot) -> Result<()> {
        info!(
            entry_id = slot.id,
            greenhouse = %slot.greenhouse,
            start = %slot.start_time,
            end = %slot.end_time,
            "watering time"
        );
        self.notifier
            .emit(PushEvent::WateringTime {
                entry_id: slot.id,
                greenhouse_id: slot.greenhouse_id,
                greenhouse: slot.greenhouse.clone(),
                start_time: slot.start_time.clone(),
                end_time: slot.end_time.clone(),
            })
            .await;
        self.notifier.email(
            slot.owner_email.as_deref(),
            "Hora de Regar",
            &format!(
                "Es hora de regar {} (de {} a {})",
                slot.greenhouse, slot.start_time, slot.end_time
            ),
            MailSeverity::Info,
        );
        self.shared
            .write()
            .await
            .record_scheduler(format!("{}: hora de regar ({})", slot.greenhouse, slot.start_time));

        let Some(device_id) = slot.device_id else {
            warn!(greenhouse = %slot.greenhouse, "greenhouse has no device, nothing to switch");
            return Ok(());
        };
        let Some(pump) = self.db.active_pump_for_device(device_id).await? else {
            warn!(greenhouse = %slot.greenhouse, device_id, "no active pump, reminder only");
            return Ok(());
        };

        let minutes = slot
            .duration_minutes
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_RUN_MINUTES);
        self.dispatcher
            .start_timed(
                device_id,
                pump.id,
                TriggerMode::Scheduled,
                Duration::from_secs(minutes as u64 * 60),
            )
            .await?;
        self.notifier
            .emit(PushEvent::IrrigationStarted {
                entry_id: slot.id,
                device_id,
                actuator_id: pump.id,
                duration_minutes: minutes,
            })
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    pub async fn check_heartbeats(&self, now_ts: i64) -> Result<usize> {
        let cutoff = now_ts - self.heartbeat_timeout.as_secs() as i64;
        let stale = self.db.stale_active_devices(cutoff).await?;

        let mut flagged = 0;
        for device in stale {
            if self
                .db
                .unread_alert_since(device.id, AlertKind::DeviceOffline, now_ts - OFFLINE_DEDUP_SECS)
                .await?
            {
                continue;
            }

            let quiet_min = device.last_seen.map(|seen| (now_ts - seen) / 60).unwrap_or_default();
            let message = format!("{}: sin conexión desde hace {} minutos", device.name, quiet_min);
            warn!(device = %device.name, quiet_min, "device offline");

            self.db
                .insert_alert(&NewAlert {
                    device_id: device.id,
                    kind: AlertKind::DeviceOffline,
                    severity: Severity::High,
                    message: &message,
                    created_at: now_ts,
                })
                .await?;

            let owner = match device.user_id {
                Some(id) => self.db.get_user(id).await?.and_then(|u| u.email),
                None => None,
            };
            self.notifier.email(
                owner.as_deref(),
                &format!("Dispositivo {} sin conexión", device.name),
                &message,
                MailSeverity::Critical,
            );
            self.notifier
                .emit(PushEvent::DeviceOffline {
                    device_id: device.id,
                    device: device.name.clone(),
                    last_seen: device.last_seen,
                })
                .await;
            flagged += 1;
        }
        Ok(flagged)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now_unix, ActuatorState, CalendarEntry, Transition};
    use crate::testkit::{collect_mail, drain, harness, Harness};

    fn scheduler(h: &Harness) -> WateringScheduler {
        WateringScheduler::new(
            h.db.clone(),
            h.dispatcher.clone(),
            h.notifier.clone(),
            h.shared.clone(),
            DEFAULT_TICK,
            DEFAULT_HEARTBEAT_TIMEOUT,
        )
    }

    /// 2024-01-01 was a Monday.
    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn entry_with_dates(start: Option<&str>, end: Option<&str>) -> CalendarEntry {
        CalendarEntry {
            id: 1,
            greenhouse_id: 1,
            user_id: None,
            day_of_week: "Lunes".into(),
            start_time: "08:00:00".into(),
            end_time: "08:30:00".into(),
            duration_minutes: None,
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
            active: true,
        }
    }

    // -- Helpers --------------------------------------------------------------

    #[test]
    fn spanish_day_names() {
        assert_eq!(day_name(Weekday::Sun), "Domingo");
        assert_eq!(day_name(Weekday::Mon), "Lunes");
        assert_eq!(day_name(Weekday::Wed), "Miércoles");
        assert_eq!(day_name(Weekday::Sat), "Sábado");
        assert_eq!(day_name(monday(8, 0).weekday()), "Lunes");
    }

    #[test]
    fn dates_accept_timestamps_and_reject_garbage() {
        assert_eq!(parse_date(Some("2024-03-05")), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(parse_date(Some("2024-03-05T00:00:00Z")), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(parse_date(Some("mañana")), None);
        assert_eq!(parse_date(None), None);
    }

    // -- Calendar -------------------------------------------------------------

    #[tokio::test]
    async fn exact_minute_fires_and_starts_the_pump() {
        let mut h = harness(true).await;
        let mut rx = h.notifier.subscribe();
        let s = scheduler(&h);
        let before = now_unix();

        assert_eq!(s.evaluate_calendar(monday(8, 0), now_unix()).await.unwrap(), 1);

        let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert!(names.contains(&"schedule:watering-time"));
        assert!(names.contains(&"irrigation:started"));

        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::On);
        let ev = h.db.events_for_actuator(10).await.unwrap();
        assert_eq!(ev[0].mode, TriggerMode::Scheduled);
        let deadline = ev[0].pending_off_at.unwrap();
        assert!(deadline >= before + 600 && deadline <= now_unix() + 600);

        let mail = collect_mail(&mut h.mail).await;
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].subject, "Hora de Regar");
        assert_eq!(mail[0].to, "ana@example.com");
    }

    #[tokio::test]
    async fn same_minute_fires_once() {
        let h = harness(true).await;
        let s = scheduler(&h);
        let now = now_unix();

        assert_eq!(s.evaluate_calendar(monday(8, 0), now).await.unwrap(), 1);
        assert_eq!(s.evaluate_calendar(monday(8, 0), now + 30).await.unwrap(), 0);
        assert_eq!(h.db.events_for_actuator(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_minutes_and_days_do_not_fire() {
        let h = harness(true).await;
        let s = scheduler(&h);

        assert_eq!(s.evaluate_calendar(monday(8, 1), now_unix()).await.unwrap(), 0);
        assert_eq!(s.evaluate_calendar(monday(7, 59), now_unix()).await.unwrap(), 0);
        let tuesday = monday(8, 0) + chrono::Duration::days(1);
        assert_eq!(s.evaluate_calendar(tuesday, now_unix()).await.unwrap(), 0);
        assert!(h.db.events_for_actuator(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn date_bounds_are_respected() {
        let h = harness(true).await;
        let s = scheduler(&h);

        h.db.upsert_calendar_entry(&entry_with_dates(None, Some("2023-12-31")))
            .await
            .unwrap();
        assert_eq!(s.evaluate_calendar(monday(8, 0), now_unix()).await.unwrap(), 0);

        h.db.upsert_calendar_entry(&entry_with_dates(Some("2024-01-01"), Some("2024-01-31")))
            .await
            .unwrap();
        assert_eq!(s.evaluate_calendar(monday(8, 0), now_unix()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn configured_duration_sets_the_deadline() {
        let h = harness(true).await;
        let s = scheduler(&h);
        h.db.upsert_calendar_entry(&CalendarEntry {
            duration_minutes: Some(25),
            ..entry_with_dates(None, None)
        })
        .await
        .unwrap();
        let before = now_unix();

        s.evaluate_calendar(monday(8, 0), now_unix()).await.unwrap();

        let deadline = h.db.events_for_actuator(10).await.unwrap()[0].pending_off_at.unwrap();
        assert!(deadline >= before + 25 * 60);
    }

    #[tokio::test]
    async fn disabled_entry_does_not_fire() {
        let h = harness(true).await;
        let s = scheduler(&h);
        h.db.disable_calendar_for_device(1).await.unwrap();

        assert_eq!(s.evaluate_calendar(monday(8, 0), now_unix()).await.unwrap(), 0);
    }

    // -- Heartbeat ------------------------------------------------------------

    #[tokio::test]
    async fn quiet_device_is_flagged_once() {
        let mut h = harness(true).await;
        let mut rx = h.notifier.subscribe();
        let s = scheduler(&h);
        let now = now_unix();
        h.db.touch_device(1, now - 10 * 60).await.unwrap();

        assert_eq!(s.check_heartbeats(now).await.unwrap(), 1);
        assert_eq!(s.check_heartbeats(now + 60).await.unwrap(), 0);

        let alerts = h.db.alerts_for_device(1).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DeviceOffline);
        assert_eq!(alerts[0].severity, Severity::High);
        assert!(drain(&mut rx).iter().any(|e| e.name() == "device:offline"));
        assert_eq!(collect_mail(&mut h.mail).await.len(), 1);
    }

    #[tokio::test]
    async fn old_offline_alert_does_not_suppress_a_new_one() {
        let h = harness(true).await;
        let s = scheduler(&h);
        let now = now_unix();
        h.db.touch_device(1, now - 3 * 60 * 60).await.unwrap();
        h.db.insert_alert(&NewAlert {
            device_id: 1,
            kind: AlertKind::DeviceOffline,
            severity: Severity::High,
            message: "riego-1: sin conexión",
            created_at: now - 2 * 60 * 60,
        })
        .await
        .unwrap();

        assert_eq!(s.check_heartbeats(now).await.unwrap(), 1);
        assert_eq!(h.db.alerts_for_device(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn recent_contact_is_not_offline() {
        let h = harness(true).await;
        let s = scheduler(&h);
        let now = now_unix();
        h.db.touch_device(1, now - 60).await.unwrap();

        // device 2 has never been heard from
        assert_eq!(s.check_heartbeats(now).await.unwrap(), 0);
    }

    // -- Recovery ---------------------------------------------------------------

    #[tokio::test]
    async fn tick_recovers_overdue_auto_off() {
        let h = harness(true).await;
        h.db.disable_calendar_for_device(1).await.unwrap();
        let s = scheduler(&h);

        let event_id = h
            .db
            .apply_transition(&Transition {
                device_id: 1,
                actuator_id: 10,
                state: ActuatorState::On,
                mode: TriggerMode::Scheduled,
                user_id: None,
                ts: now_unix() - 900,
            })
            .await
            .unwrap();
        h.db.set_pending_off(event_id, now_unix() - 300).await.unwrap();

        let report = s.tick(Local::now()).await;

        assert_eq!(report.finished, 1);
        assert_eq!(report.fired, 0);
        assert_eq!(h.db.get_actuator(10).await.unwrap().unwrap().state, ActuatorState::Off);
    }
}
