use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zone_audio::config::ClientConfig;
use zone_audio::host::sim::SimWorld;
use zone_audio::host::tick::TickLoop;
use zone_audio::host::TickHost;
use zone_audio::metrics::Metrics;
use zone_audio::net::{AudioClient, WebSocketConnector};
use zone_audio::regions::{select_region_service, GRID_INDEX_VERSION};

const TICKS_PER_SECOND: u32 = 20;
const DEFAULT_BOT_COUNT: usize = 16;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Zone Audio client v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "zone-audio.toml".to_string());
    let config = match ClientConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", config_path, e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration, not connecting: {}", e);
        return Err(e.into());
    }
    info!(
        "Configuration loaded: {}, {} tracks, {} regions",
        config.websocket_uri(),
        config.audio_tracks.len(),
        config.regions.len()
    );

    let provider_version =
        std::env::var("REGION_PROVIDER_VERSION").unwrap_or_else(|_| GRID_INDEX_VERSION.to_string());
    let regions = select_region_service(&provider_version, &config.regions)?;

    let metrics = Arc::new(Metrics::new());

    #[cfg(feature = "metrics_http")]
    {
        let metrics_port: u16 = env_or("METRICS_PORT", 9090);
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = zone_audio::metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // Simulated world with wandering bots
    let tick_loop = Arc::new(TickLoop::new());
    let world = Arc::new(SimWorld::new());
    let bot_count: usize = env_or("BOT_COUNT", DEFAULT_BOT_COUNT);
    let bots = world.spawn_bots(bot_count, "world", 256.0);
    info!("Spawned {} bots", bots.len());
    {
        let world = world.clone();
        tick_loop.run_every(0, 1, Box::new(move || world.step(0.3)));
    }
    let driver = tick_loop.spawn_driver(TICKS_PER_SECOND);

    let client = AudioClient::new(
        config,
        Arc::new(WebSocketConnector),
        tick_loop.clone(),
        world.clone(),
        regions,
        metrics.clone(),
    )?;

    let handshake = client.connect()?;
    tokio::spawn(async move {
        match handshake.wait().await {
            Ok(session) => info!("Audio session {} established", session),
            Err(e) => warn!("First connect attempt failed: {}", e),
        }
    });

    // Bots are local players the remote service may ask about
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("Player {} is now {:?}", event.player, event.status);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    info!("Shutting down...");
    if tokio::time::timeout(Duration::from_secs(10), client.shutdown()).await.is_err() {
        warn!("Shutdown timed out");
    }
    driver.stop();
    info!("Client stopped");

    Ok(())
}
