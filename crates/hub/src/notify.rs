//! Notification fan-out: named real-time push events for browser clients and
//! fire-and-forget alert e-mails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::{ActuatorState, TriggerMode};
use crate::state::SharedState;

const PUSH_CAPACITY: usize = 256;
const BREVO_URL: &str = "https://api.brevo.com/v3/smtp/email";
const SUBJECT_PREFIX: &str = "[Sistema Riego]";

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReadingUpdate {
    pub sensor_id: i64,
    pub kind: crate::db::SensorKind,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum PushEvent {
    #[serde(rename = "sensor:update")]
    SensorUpdate {
        device_id: i64,
        device: String,
        readings: Vec<ReadingUpdate>,
        ts: i64,
    },
    #[serde(rename = "device:event")]
    DeviceEvent {
        device_id: i64,
        device: String,
        kind: String,
        message: String,
    },
    #[serde(rename = "alert:riego_sugerido")]
    IrrigationSuggested {
        device_id: i64,
        actuator_id: i64,
        sensor_id: i64,
        config_id: i64,
        value: f64,
        lower_threshold: f64,
        message: String,
    },
    #[serde(rename = "alert:riego_activo")]
    IrrigationActive {
        device_id: i64,
        actuator_id: i64,
        actuator: String,
        mode: TriggerMode,
    },
    #[serde(rename = "schedule:watering-time")]
    WateringTime {
        entry_id: i64,
        greenhouse_id: i64,
        greenhouse: String,
        start_time: String,
        end_time: String,
    },
    #[serde(rename = "irrigation:started")]
    IrrigationStarted {
        entry_id: i64,
        device_id: i64,
        actuator_id: i64,
        duration_minutes: i64,
    },
    #[serde(rename = "irrigation:finished")]
    IrrigationFinished {
        device_id: i64,
        actuator_id: i64,
        mode: TriggerMode,
    },
    #[serde(rename = "actuator:state-changed")]
    ActuatorStateChanged {
        device_id: i64,
        actuator_id: i64,
        state: ActuatorState,
        mode: TriggerMode,
    },
    #[serde(rename = "device:offline")]
    DeviceOffline {
        device_id: i64,
        device: String,
        last_seen: Option<i64>,
    },
    #[serde(rename = "calendar:disabled")]
    CalendarDisabled {
        device_id: i64,
        greenhouse_ids: Vec<i64>,
        entries: u64,
    },
}

impl PushEvent {
    /// Event name as seen by push clients.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::SensorUpdate { .. } => "sensor:update",
            PushEvent::DeviceEvent { .. } => "device:event",
            PushEvent::IrrigationSuggested { .. } => "alert:riego_sugerido",
            PushEvent::IrrigationActive { .. } => "alert:riego_activo",
            PushEvent::WateringTime { .. } => "schedule:watering-time",
            PushEvent::IrrigationStarted { .. } => "irrigation:started",
            PushEvent::IrrigationFinished { .. } => "irrigation:finished",
            PushEvent::ActuatorStateChanged { .. } => "actuator:state-changed",
            PushEvent::DeviceOffline { .. } => "device:offline",
            PushEvent::CalendarDisabled { .. } => "calendar:disabled",
        }
    }
}

// ---------------------------------------------------------------------------
// E-mail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailSeverity {
    Info,
    Warning,
    Critical,
}

impl MailSeverity {
    fn color(self) -> &'static str {
        match self {
            MailSeverity::Info => "#3B82F6",
            MailSeverity::Warning => "#F59E0B",
            MailSeverity::Critical => "#EF4444",
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_alert(&self, to: &str, subject: &str, message: &str, severity: MailSeverity) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub api_key: Option<String>,
    pub sender_email: String,
    pub app_url: String,
}

/// Brevo transactional e-mail over its HTTP API.
pub struct BrevoMailer {
    http: Client,
    settings: MailSettings,
}

impl BrevoMailer {
    pub fn new(settings: MailSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build mail http client")?;
        Ok(Self { http, settings })
    }

    fn render(&self, message: &str, severity: MailSeverity) -> String {
        let color = severity.color();
        let message = escape_html(message);
        format!(
            r#"<!DOCTYPE html>
<html>
  <body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <div style="max-width: 600px; margin: 0 auto; padding: 20px; border: 1px solid #e5e7eb; border-radius: 8px;">
      <div style="background-color: {color}; color: white; padding: 15px; border-radius: 8px 8px 0 0; text-align: center;">
        <h2 style="margin:0;">Alerta del Sistema</h2>
      </div>
      <div style="padding: 20px; background-color: #f9fafb;">
        <p>Se ha detectado el siguiente evento en tu sistema de riego:</p>
        <div style="background: white; padding: 15px; border-left: 4px solid {color}; margin: 15px 0;">
          <strong>{message}</strong>
        </div>
        <a href="{url}/dashboard" style="display: inline-block; background-color: #10B981; color: white; padding: 10px 20px; text-decoration: none; border-radius: 5px;">Ir al Dashboard</a>
      </div>
    </div>
  </body>
</html>"#,
            url = escape_html(self.settings.app_url.trim_end_matches('/')),
        )
    }
}

/// Device-supplied text ends up in the alert body.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Subjects are a plain-text header: no markup, no line breaks.
fn plain_subject(subject: &str) -> String {
    subject
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| !matches!(c, '<' | '>'))
        .collect()
}

#[async_trait]
impl Mailer for BrevoMailer {
    async fn send_alert(&self, to: &str, subject: &str, message: &str, severity: MailSeverity) -> Result<()> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            warn!(to, "mail: BREVO_API_KEY not set, alert e-mail not sent");
            return Ok(());
        };

        let body = json!({
            "sender": { "name": "Sistema Riego IoT", "email": self.settings.sender_email },
            "to": [{ "email": to }],
            "subject": format!("{SUBJECT_PREFIX} {}", plain_subject(subject)),
            "htmlContent": self.render(message, severity),
        });

        let response = self
            .http
            .post(BREVO_URL)
            .header("api-key", api_key)
            .json(&body)
            .send()
            .await
            .context("brevo request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("brevo rejected e-mail: HTTP {status}: {text}");
        }

        info!(to, subject, "mail: alert sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Notifier {
    push: broadcast::Sender<PushEvent>,
    mailer: Arc<dyn Mailer>,
    shared: SharedState,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, shared: SharedState) -> Self {
        let (push, _) = broadcast::channel(PUSH_CAPACITY);
        Self { push, mailer, shared }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.push.subscribe()
    }

    /// Broadcast to every connected client. Having no listeners is normal.
    pub async fn emit(&self, event: PushEvent) {
        debug!(event = event.name(), "push");
        self.shared.write().await.record_push(&event);
        let _ = self.push.send(event);
    }

    /// Sends in the background; failures are logged and never reach the caller.
    pub fn email(&self, to: Option<&str>, subject: &str, message: &str, severity: MailSeverity) {
        let Some(to) = to.filter(|t| !t.trim().is_empty()) else {
            debug!(subject, "mail: no recipient, skipped");
            return;
        };

        let mailer = Arc::clone(&self.mailer);
        let (to, subject, message) = (to.to_string(), subject.to_string(), message.to_string());
        tokio::spawn(async move {
            if let Err(e) = mailer.send_alert(&to, &subject, &message, severity).await {
                error!(to = %to, subject = %subject, "mail: send failed: {e:#}");
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
