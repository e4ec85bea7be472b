use crate::bus::{Notification, NotificationBus, Topic};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::nav::{NavMode, Navigator, Screen, ScreenRouter};
use crate::session::SessionState;
use crate::transport::{MockLink, Transport, WsLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;
    let initial = SessionState::new(config.ui.mode());
    let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let bus = Arc::new(NotificationBus::new());
    bus.subscribe(Topic::Connection, |n| {
        if let Notification::Connection(up) = n {
            tracing::info!(connected = up, "backend link state");
        }
    });

    let router = Arc::new(ScreenRouter::new());

    let transport: Arc<dyn Transport> = if config.mock.enabled {
        tracing::warn!("mock mode enabled, no backend will be contacted");
        Arc::new(MockLink::new(
            event_tx.clone(),
            snapshot_rx.clone(),
            Duration::from_millis(config.mock.response_delay_ms),
            Duration::from_millis(config.mock.followup_delay_ms),
            config.ui.mode(),
        ))
    } else {
        Arc::new(WsLink::new(
            config.connection.url.clone(),
            config.protocol.handshake_destination(),
            Duration::from_millis(config.connection.retry_delay_ms),
            event_tx.clone(),
        ))
    };

    // Land on the default mode's home before the backend weighs in; the
    // UI_TYPE answer after connect corrects the mode if it changed.
    router.go_to(Screen::home_for(initial.ui_mode), NavMode::Replace);

    let dispatcher = Dispatcher::new(
        initial,
        transport.clone(),
        router.clone(),
        bus.clone(),
        snapshot_tx,
    );

    transport.connect();
    let dispatch_task = tokio::spawn(dispatcher.run(event_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown: ctrl-c");
    transport.disconnect();
    dispatch_task.abort();
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
