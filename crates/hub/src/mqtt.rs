use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Deserializer, Serialize};

use crate::db::SensorKind;

pub const TOPIC_ROOT: &str = "riego";

/// Everything devices send upstream.
pub const SUBSCRIPTIONS: [&str; 3] = ["riego/+/sensores", "riego/+/eventos", "riego/+/ping"];

// ---------------------------------------------------------------------------
// Inbound topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sensors,
    Event,
    Ping,
}

impl MessageKind {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "sensores" => Some(MessageKind::Sensors),
            "eventos" => Some(MessageKind::Event),
            "ping" => Some(MessageKind::Ping),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Sensors => "sensores",
            MessageKind::Event => "eventos",
            MessageKind::Ping => "ping",
        }
    }
}

/// Split "riego/<credential>/<type>" into its credential and type segments.
pub fn split_topic(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == TOPIC_ROOT && !parts[1].is_empty() && !parts[2].is_empty() {
        Some((parts[1], parts[2]))
    } else {
        None
    }
}

pub fn command_topic(credential: &str) -> String {
    format!("{TOPIC_ROOT}/{credential}/comandos")
}

pub fn resync_topic(credential: &str) -> String {
    format!("{TOPIC_ROOT}/{credential}/comandos/all")
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// One element of a `sensores` array.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    #[serde(default)]
    pub sensor_id: Option<i64>,
    #[serde(default, deserialize_with = "pin_as_string")]
    pub pin: Option<String>,
    #[serde(default)]
    pub tipo: Option<SensorKind>,
    #[serde(default)]
    pub valor: Option<f64>,
    #[serde(default)]
    pub estado: Option<String>,
    #[serde(default)]
    pub conectado: Option<bool>,
}

impl SensorEntry {
    /// Why the device reports this sensor as unusable, if it does.
    pub fn fault(&self) -> Option<SensorFault> {
        if self.conectado == Some(false) {
            return Some(SensorFault::Disconnected);
        }
        match self.estado.as_deref() {
            None | Some("ok") => None,
            Some(other) => Some(SensorFault::Abnormal(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorFault {
    Disconnected,
    Abnormal(String),
}

/// Firmware sends pins either as labels ("A1") or bare numbers (4).
fn pin_as_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pin {
        Text(String),
        Number(i64),
    }

    Ok(Option::<Pin>::deserialize(de)?.map(|p| match p {
        Pin::Text(s) => s,
        Pin::Number(n) => n.to_string(),
    }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEventMsg {
    #[serde(default)]
    pub tipo: String,
    #[serde(default)]
    pub mensaje: String,
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActuatorCommand {
    pub actuador_id: i64,
    pub pin: String,
    pub estado: u8,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActuatorStateEntry {
    pub actuador_id: i64,
    pub pin: String,
    pub estado: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStateCommand {
    pub actuadores: Vec<ActuatorStateEntry>,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// The shared broker connection. The event loop in `main` owns the socket and
/// flips `connected` as the session comes and goes.
pub struct MqttLink {
    client: AsyncClient,
    connected: AtomicBool,
}

impl MqttLink {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            connected: AtomicBool::new(false),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queues the subscriptions. Called from the event loop itself, so it
    /// must never wait on the request queue that loop drains.
    pub fn subscribe_all(&self) -> Result<()> {
        for topic in SUBSCRIPTIONS {
            self.client
                .try_subscribe(topic, QoS::AtLeastOnce)
                .with_context(|| format!("subscribe {topic} failed"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Best-effort: a full request queue fails the publish instead of
    /// waiting for the event loop to drain it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
