mod automation;
mod cache;
mod config;
mod db;
mod dispatch;
mod error;
mod mqtt;
mod notify;
mod scheduler;
mod state;
mod telemetry;
mod weather;
mod web;

#[cfg(test)]
mod testkit;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use automation::AutomationEngine;
use cache::AppCache;
use config::Settings;
use db::Db;
use dispatch::Dispatcher;
use mqtt::MqttLink;
use notify::{BrevoMailer, Notifier};
use scheduler::WateringScheduler;
use state::SystemState;
use telemetry::{IngestRouter, TelemetryProcessor};
use weather::WeatherService;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riego_hub=info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let settings = Settings::from_env()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.db_url).await?;
    db.migrate().await?;

    // ── Seed file (optional) ────────────────────────────────────────
    match settings.config_path.as_deref() {
        Some(path) => {
            let cfg = config::load(path)?;
            config::apply(&cfg, &db).await?;
        }
        None => info!("CONFIG_PATH not set, using the database as is"),
    }

    // ── Shared state + cache ────────────────────────────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    let cache = Arc::new(AppCache::new());
    cache.spawn_sweepers();

    // ── Outbound services ───────────────────────────────────────────
    let mailer = Arc::new(BrevoMailer::new(settings.mail.clone())?);
    let notifier = Notifier::new(mailer, shared.clone());
    let weather = Arc::new(WeatherService::new(&settings.weather)?);

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = format!("riego-hub-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, settings.mqtt_host.clone(), settings.mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&settings.mqtt_username, &settings.mqtt_password) {
        mqttoptions.set_credentials(user.clone(), pass.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    let link = Arc::new(MqttLink::new(client));

    // ── Pipeline ────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(db.clone(), link.clone(), notifier.clone());
    let automation = AutomationEngine::new(
        db.clone(),
        cache.clone(),
        dispatcher.clone(),
        notifier.clone(),
        weather,
        shared.clone(),
        settings.default_coordinates,
    );
    let processor = Arc::new(TelemetryProcessor::new(
        db.clone(),
        cache.clone(),
        notifier.clone(),
        automation,
        shared.clone(),
    ));
    let router = IngestRouter::new(processor);

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler = Arc::new(WateringScheduler::new(
        db.clone(),
        dispatcher.clone(),
        notifier.clone(),
        shared.clone(),
        settings.tick,
        settings.heartbeat_timeout,
    ));
    tokio::spawn(scheduler.run());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::WebState {
        shared: shared.clone(),
        db: db.clone(),
        cache: cache.clone(),
        dispatcher: dispatcher.clone(),
        notifier: notifier.clone(),
        config_path: settings.config_path.clone(),
    };
    let web_port = settings.web_port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    info!(
        broker = %settings.mqtt_host,
        port = settings.mqtt_port,
        "connecting to broker"
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                router.route(p.topic.clone(), p.payload.to_vec()).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                link.set_connected(true);
                // subscriptions are re-issued on every (re)connect
                if let Err(e) = link.subscribe_all() {
                    warn!("subscribe failed: {e:#}");
                }
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                link.set_connected(false);
                warn!("mqtt disconnected by broker");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                link.set_connected(false);
                error!("mqtt error: {e}");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
