use tuya_relay::{AppState, Config, DeviceDirectory, Dispatcher, Scanner, TuyaLink, router};

use log::{info, warn};
use tokio::net::TcpListener;

type ErasedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), ErasedError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = Config::default_path();
    let config = Config::load_or_create(&path)
        .unwrap_or_else(|err| {
            warn!("[CONFIG] {}; using defaults", err);
            Config::default()
        })
        .apply_env()?;

    let scanner = Scanner::new().with_timeout(config.scan_timeout());
    let link = TuyaLink {
        timeout: config.command_timeout(),
        ..TuyaLink::default()
    };
    let dispatcher = Dispatcher::new(DeviceDirectory::new(scanner), link, &config.site_name);
    let state = AppState::new(
        dispatcher,
        config.max_concurrent_commands,
        config.request_timeout(),
    );

    info!(
        "[START] tuya-relay {} (SITE={})",
        tuya_relay::VERSION,
        config.site_name
    );

    let inventory = state.clone();
    tokio::spawn(async move {
        inventory.dispatcher().directory().inventory().await;
    });

    let listener = TcpListener::bind(config.bind).await?;
    info!("Listening http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("[STOP] tuya-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}
