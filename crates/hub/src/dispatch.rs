//! Actuator command dispatcher: the only code path that changes an
//! actuator's state.
//!
//! A dispatch persists the new state together with its audit event, tells
//! push clients, then tries to deliver the command to the device. Delivery is
//! best-effort; the stored state is authoritative and devices can be resynced.
//!
//! ## Timed auto-off
//!
//! ```text
//! start_timed ──▶ ON + pending_off_at=deadline ──[timer | scheduler sweep]──▶ claim ──▶ OFF
//!                        │
//!                        └──[any other dispatch on the actuator]──▶ deadline cleared, timer aborted
//! ```
//!
//! The timer is the fast path; the scheduler's sweep of due deadlines covers
//! restarts. Whoever claims the deadline first performs the off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::db::{now_unix, Actuator, ActuatorState, Db, Device, PendingOff, Transition, TriggerMode};
use crate::error::DispatchError;
use crate::mqtt::{command_topic, resync_topic, ActuatorCommand, ActuatorStateEntry, DeviceStateCommand, Transport};
use crate::notify::{Notifier, PushEvent};

#[derive(Debug, Clone, Serialize)]
pub struct Dispatched {
    pub event_id: i64,
    pub device_id: i64,
    pub actuator_id: i64,
    pub state: ActuatorState,
    /// Whether the command reached the broker.
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub actuator_id: i64,
    pub actuator: String,
    pub ok: bool,
    pub error: Option<String>,
}

struct OffTimer {
    event_id: i64,
    handle: AbortHandle,
}

struct Inner {
    db: Db,
    transport: Arc<dyn Transport>,
    notifier: Notifier,
    timers: Mutex<HashMap<i64, OffTimer>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(db: Db, transport: Arc<dyn Transport>, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                transport,
                notifier,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Core dispatch
    // -----------------------------------------------------------------------

    pub async fn control_actuator(
        &self,
        device_id: i64,
        actuator_id: i64,
        state: ActuatorState,
        mode: TriggerMode,
        user_id: Option<i64>,
    ) -> Result<Dispatched, DispatchError> {
        let db = &self.inner.db;
        let device = db
            .get_device(device_id)
            .await?
            .ok_or(DispatchError::DeviceNotFound(device_id))?;
        let actuator = db
            .get_actuator(actuator_id)
            .await?
            .ok_or(DispatchError::ActuatorNotFound(actuator_id))?;
        if actuator.device_id != device.id {
            return Err(DispatchError::ActuatorNotOnDevice {
                device_id,
                actuator_id,
            });
        }

        let event_id = db
            .apply_transition(&Transition {
                device_id,
                actuator_id,
                state,
                mode,
                user_id,
                ts: now_unix(),
            })
            .await?;
        self.cancel_timer(actuator_id);

        let notifier = &self.inner.notifier;
        if state == ActuatorState::On {
            notifier
                .emit(PushEvent::IrrigationActive {
                    device_id,
                    actuator_id,
                    actuator: actuator.name.clone(),
                    mode,
                })
                .await;
        }
        notifier
            .emit(PushEvent::ActuatorStateChanged {
                device_id,
                actuator_id,
                state,
                mode,
            })
            .await;

        let delivered = self.send_command(&device, &actuator, state).await;

        info!(
            device = %device.name,
            actuator = %actuator.name,
            state = state.as_str(),
            mode = mode.as_str(),
            delivered,
            "actuator dispatched"
        );

        Ok(Dispatched {
            event_id,
            device_id,
            actuator_id,
            state,
            delivered,
        })
    }

    async fn send_command(&self, device: &Device, actuator: &Actuator, state: ActuatorState) -> bool {
        let cmd = ActuatorCommand {
            actuador_id: actuator.id,
            pin: actuator.pin.clone(),
            estado: state.as_bit(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.publish_json(&command_topic(&device.api_key), &cmd, &device.name).await
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, payload: &T, device: &str) -> bool {
        let transport = &self.inner.transport;
        if !transport.is_connected() {
            warn!(device, topic, "mqtt not connected, command not sent");
            return false;
        }

        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                error!(device, topic, "command serialization failed: {e}");
                return false;
            }
        };

        match transport.publish(topic, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device, topic, "command publish failed: {e:#}");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timed auto-off
    // -----------------------------------------------------------------------

    /// Turns the actuator on and owes it an off after `run_for`.
    pub async fn start_timed(
        &self,
        device_id: i64,
        actuator_id: i64,
        mode: TriggerMode,
        run_for: Duration,
    ) -> Result<Dispatched, DispatchError> {
        let started = self
            .control_actuator(device_id, actuator_id, ActuatorState::On, mode, None)
            .await?;

        let deadline = now_unix() + run_for.as_secs() as i64;
        self.inner.db.set_pending_off(started.event_id, deadline).await?;
        self.arm_timer(
            PendingOff {
                event_id: started.event_id,
                device_id,
                actuator_id,
                mode,
                pending_off_at: deadline,
            },
            run_for,
        );

        info!(
            device_id,
            actuator_id,
            run_for_sec = run_for.as_secs(),
            deadline,
            "auto-off scheduled"
        );
        Ok(started)
    }

    fn arm_timer(&self, pending: PendingOff, after: Duration) {
        let actuator_id = pending.actuator_id;
        let event_id = pending.event_id;
        let this = self.clone();
        // The task waits until its handle is registered, so a timer that fires
        // at once can never find itself in the map and abort its own off.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(after).await;
            this.forget_timer(pending.actuator_id, pending.event_id);
            if let Err(e) = this.finish_timed(&pending).await {
                error!(actuator_id = pending.actuator_id, "auto-off failed: {e}");
            }
        });

        let previous = self.inner.timers.lock().insert(
            actuator_id,
            OffTimer {
                event_id,
                handle: task.abort_handle(),
            },
        );
        if let Some(old) = previous {
            old.handle.abort();
        }
        let _ = armed_tx.send(());
    }

    fn forget_timer(&self, actuator_id: i64, event_id: i64) {
        let mut timers = self.inner.timers.lock();
        if timers.get(&actuator_id).map(|t| t.event_id) == Some(event_id) {
            timers.remove(&actuator_id);
        }
    }

    fn cancel_timer(&self, actuator_id: i64) {
        if let Some(timer) = self.inner.timers.lock().remove(&actuator_id) {
            timer.handle.abort();
            debug!(actuator_id, event_id = timer.event_id, "pending auto-off cancelled");
        }
    }

    /// Performs an owed off if nobody else has claimed it. Returns whether
    /// this call did the work.
    pub async fn finish_timed(&self, pending: &PendingOff) -> Result<bool, DispatchError> {
        if !self.inner.db.claim_pending_off(pending.event_id).await? {
            debug!(event_id = pending.event_id, "auto-off already handled or superseded");
            return Ok(false);
        }

        self.control_actuator(
            pending.device_id,
            pending.actuator_id,
            ActuatorState::Off,
            pending.mode,
            None,
        )
        .await?;

        self.inner
            .notifier
            .emit(PushEvent::IrrigationFinished {
                device_id: pending.device_id,
                actuator_id: pending.actuator_id,
                mode: pending.mode,
            })
            .await;
        Ok(true)
    }

    /// Executes every persisted auto-off whose deadline has passed.
    pub async fn run_due_offs(&self, now: i64) -> anyhow::Result<usize> {
        let due = self.inner.db.due_pending_offs(now).await?;
        let mut done = 0;
        for pending in &due {
            match self.finish_timed(pending).await {
                Ok(true) => done += 1,
                Ok(false) => {}
                Err(e) => error!(
                    event_id = pending.event_id,
                    actuator_id = pending.actuator_id,
                    "overdue auto-off failed: {e}"
                ),
            }
        }
        Ok(done)
    }

    #[cfg(test)]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().len()
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Manual switch from the UI. Turning something on by hand suspends the
    /// greenhouse calendar so the schedule does not fight the operator.
    pub async fn manual_control(
        &self,
        actuator_id: i64,
        state: ActuatorState,
        user_id: Option<i64>,
    ) -> Result<Dispatched, DispatchError> {
        let actuator = self
            .inner
            .db
            .get_actuator(actuator_id)
            .await?
            .ok_or(DispatchError::ActuatorNotFound(actuator_id))?;

        let done = self
            .control_actuator(actuator.device_id, actuator_id, state, TriggerMode::Manual, user_id)
            .await?;

        if state == ActuatorState::On {
            let (greenhouse_ids, entries) = self
                .inner
                .db
                .disable_calendar_for_device(actuator.device_id)
                .await?;
            if entries > 0 {
                info!(
                    device_id = actuator.device_id,
                    entries,
                    "calendar disabled by manual irrigation"
                );
                self.inner
                    .notifier
                    .emit(PushEvent::CalendarDisabled {
                        device_id: actuator.device_id,
                        greenhouse_ids,
                        entries,
                    })
                    .await;
            }
        }

        Ok(done)
    }

    /// Turns off every active actuator of the device. One failure does not
    /// stop the rest; each actuator gets its own outcome.
    pub async fn emergency_stop(&self, device_id: i64, user_id: Option<i64>) -> Result<Vec<StopOutcome>, DispatchError> {
        let db = &self.inner.db;
        let device = db
            .get_device(device_id)
            .await?
            .ok_or(DispatchError::DeviceNotFound(device_id))?;
        let actuators = db.actuators_for_device(device_id).await?;

        let mut outcomes = Vec::new();
        for actuator in actuators.into_iter().filter(|a| a.active) {
            let result = self
                .control_actuator(
                    device_id,
                    actuator.id,
                    ActuatorState::Off,
                    TriggerMode::Emergency,
                    user_id,
                )
                .await;
            let outcome = match result {
                Ok(_) => StopOutcome {
                    actuator_id: actuator.id,
                    actuator: actuator.name,
                    ok: true,
                    error: None,
                },
                Err(e) => {
                    error!(device = %device.name, actuator_id = actuator.id, "emergency stop failed: {e}");
                    StopOutcome {
                        actuator_id: actuator.id,
                        actuator: actuator.name,
                        ok: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        warn!(
            device = %device.name,
            stopped = outcomes.iter().filter(|o| o.ok).count(),
            failed = outcomes.iter().filter(|o| !o.ok).count(),
            "emergency stop"
        );
        Ok(outcomes)
    }

    /// Republishes every actuator's stored state so the device can catch up.
    pub async fn publish_device_state(&self, device_id: i64) -> Result<bool, DispatchError> {
        let db = &self.inner.db;
        let device = db
            .get_device(device_id)
            .await?
            .ok_or(DispatchError::DeviceNotFound(device_id))?;
        let actuators = db.actuators_for_device(device_id).await?;

        let payload = DeviceStateCommand {
            actuadores: actuators
                .iter()
                .map(|a| ActuatorStateEntry {
                    actuador_id: a.id,
                    pin: a.pin.clone(),
                    estado: a.state.as_bit(),
                })
                .collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        let delivered = self
            .publish_json(&resync_topic(&device.api_key), &payload, &device.name)
            .await;
        if delivered {
            info!(device = %device.name, actuators = actuators.len(), "device state resynced");
        }
        Ok(delivered)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
