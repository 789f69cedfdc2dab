//! `haven`: headless host for the emergency engine.
//!
//! Reads commands from stdin, prints engine events as they happen. Spoken
//! input is simulated with `say <text>`, which feeds a channel-backed
//! transcript source exactly like a recogniser would.

mod console;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use haven_core::capability::overpass::DEFAULT_ENDPOINT;
use haven_core::capability::stub::{
    ChannelTranscriptSource, RecordingGateway, StaticPoiService, TranscriptFeed,
};
use haven_core::{
    EmergencyEngine, NotificationGateway, OverpassPoiService, PoiService, WebhookGateway,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use console::ConsoleCommand;
use settings::AppSettings;

fn build_gateway(settings: &AppSettings) -> Arc<dyn NotificationGateway> {
    if settings.webhooks.is_empty() {
        warn!("no webhooks configured; alerts are logged, not delivered");
        return Arc::new(RecordingGateway::new());
    }
    let gateway = settings
        .webhooks
        .endpoints()
        .fold(WebhookGateway::new(), |gw, (channel, url)| {
            gw.with_endpoint(channel, url)
        });
    Arc::new(gateway)
}

fn build_poi(settings: &AppSettings) -> anyhow::Result<Arc<dyn PoiService>> {
    if !settings.live_poi_lookup {
        return Ok(Arc::new(StaticPoiService::empty()));
    }
    let endpoint = settings
        .overpass_endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let service = OverpassPoiService::new(endpoint, Duration::from_secs(10))
        .context("building points-of-interest client")?;
    info!(endpoint = service.endpoint(), "live POI lookup enabled");
    Ok(Arc::new(service))
}

/// Attach a fresh console transcript source; returns its feed.
async fn listen(engine: &EmergencyEngine) -> anyhow::Result<TranscriptFeed> {
    let (source, feed) = ChannelTranscriptSource::new();
    engine
        .start_listening(Box::new(source))
        .await
        .context("starting transcript source")?;
    Ok(feed)
}

/// Returns `false` when the console should exit.
async fn execute(
    command: ConsoleCommand,
    engine: &EmergencyEngine,
    settings: &AppSettings,
    feed: &mut Option<TranscriptFeed>,
) -> anyhow::Result<bool> {
    match command {
        ConsoleCommand::Activate => {
            engine.activate().await?;
        }
        ConsoleCommand::Confirm => {
            engine.confirm_now().await?;
        }
        ConsoleCommand::Cancel => {
            engine.cancel().await?;
        }
        ConsoleCommand::Reset => {
            engine.reset().await?;
        }
        ConsoleCommand::State => println!("{}", console::render_snapshot(&engine.state())),
        ConsoleCommand::Say(text) => {
            let delivered = feed.as_ref().is_some_and(|f| f.say(text, true));
            if !delivered {
                println!("not listening (type `listen on`)");
            }
        }
        ConsoleCommand::Trigger(word) => {
            if !engine.simulate_trigger(word).await? {
                println!("no session opened");
            }
        }
        ConsoleCommand::Listen(true) => {
            *feed = Some(listen(engine).await?);
            println!("listening");
        }
        ConsoleCommand::Listen(false) => {
            engine.stop_listening().await?;
            *feed = None;
            println!("not listening");
        }
        ConsoleCommand::Position(position) => engine.update_position(position).await?,
        ConsoleCommand::Locations(category) => {
            let ranked = engine.query_locations(category);
            if ranked.is_empty() {
                println!("no locations");
            }
            for (i, location) in ranked.iter().enumerate() {
                println!("{}", console::render_location(i + 1, location));
            }
        }
        ConsoleCommand::Contacts => {
            if settings.contacts.is_empty() {
                println!("no contacts configured");
            }
            for (i, contact) in settings.contacts.iter().enumerate() {
                println!(
                    "{:>2}. {} ({}) {}{}",
                    i + 1,
                    contact.name,
                    contact.relationship,
                    contact.phone,
                    contact
                        .email
                        .as_deref()
                        .map(|e| format!(" <{e}>"))
                        .unwrap_or_default()
                );
            }
        }
        ConsoleCommand::TestAlert(n) => {
            let contact = settings
                .contacts
                .get(n - 1)
                .with_context(|| format!("no contact number {n}"))?;
            let ack = engine.send_test_alert(contact).await?;
            println!(
                "test alert sent to {} ({})",
                contact.name,
                ack.reference.as_deref().unwrap_or("no reference")
            );
        }
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("haven=info")),
        )
        .init();

    let path = settings::settings_path();
    let settings = settings::load_settings(&path);
    if !path.exists() {
        if let Err(e) = settings::save_settings(&path, &settings) {
            warn!(path = %path.display(), "could not write default settings: {e}");
        }
    }
    info!(
        path = %path.display(),
        contacts = settings.contacts.len(),
        countdown = settings.countdown_seconds,
        "settings loaded"
    );
    if settings.contacts.is_empty() {
        warn!("no emergency contacts configured; edit {}", path.display());
    }

    let engine = Arc::new(EmergencyEngine::new(
        settings.engine_config(),
        build_gateway(&settings),
        build_poi(&settings)?,
    ));

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", console::render_event(&event)),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut feed = Some(listen(&engine).await?);
    println!("haven ready. type `help` for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e:#}");
                continue;
            }
        };
        match execute(command, &engine, &settings, &mut feed).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }

    engine.shutdown().await?;
    drop(engine);
    printer.abort();
    info!("haven stopped");
    Ok(())
}
