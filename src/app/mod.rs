use crate::backend::OctoPrintClient;
use crate::channels::ReplayChannel;
use crate::config::Config;
use crate::error::BridgeError;
use crate::socket::{PrinterSocket, SocketOptions, WsConnector};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub async fn run() -> Result<(), BridgeError> {
    let command = std::env::args().nth(1);
    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;
    match command.as_deref() {
        Some("check") => handle_check(&config).await,
        _ => run_bridge(&config).await,
    }
}

async fn run_bridge(config: &Config) -> Result<(), BridgeError> {
    let client = Arc::new(build_client(config)?);
    let options = SocketOptions {
        url: client.socket_url()?.to_string(),
        reconnect: config.reconnect.policy(),
        session: config.session_options(),
    };
    tracing::info!(
        url = %options.url,
        layer_progress = options.session.layer_progress,
        "starting printer bridge"
    );

    let mut socket = PrinterSocket::new(Arc::new(WsConnector), client.clone(), client, options);
    let channels = socket.channels().clone();
    let watchers = [
        log_updates("printer_status", &channels.printer_status),
        log_updates("job_status", &channels.job_status),
        log_updates("event", &channels.events),
        log_updates("z_offset", &channels.z_offset),
    ];

    let connected = socket.connect();
    let interrupted = tokio::select! {
        res = connected => {
            res?;
            tracing::info!("printer socket connected");
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if !interrupted {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown: ctrl-c");
    socket.disconnect();
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}

fn log_updates<T>(name: &'static str, channel: &ReplayChannel<T>) -> JoinHandle<()>
where
    T: Clone + Serialize + Send + 'static,
{
    let mut updates = channel.subscribe();
    tokio::spawn(async move {
        while let Some(value) = updates.recv().await {
            match serde_json::to_string(&value) {
                Ok(json) => tracing::info!(channel = name, update = %json, "printer update"),
                Err(err) => tracing::warn!(channel = name, error = %err, "unserializable update"),
            }
        }
    })
}

fn handle_config_init() -> Result<(), BridgeError> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

/// One-shot reads, printed as JSON.
async fn handle_check(config: &Config) -> Result<(), BridgeError> {
    let client = build_client(config)?;
    let connection_state = client.fetch_connection_state().await?;
    let z_offset = match client.fetch_z_offset().await {
        Ok(offset) => Some(offset),
        Err(err) => {
            tracing::warn!(error = %err, "z-offset unavailable");
            None
        }
    };

    let report = serde_json::json!({
        "url": client.base_url().as_str(),
        "socket_url": client.socket_url()?.as_str(),
        "connection_state": connection_state,
        "z_offset": z_offset,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_client(config: &Config) -> Result<OctoPrintClient, BridgeError> {
    let mut builder =
        OctoPrintClient::builder(config.octoprint.url.trim()).timeout(config.octoprint.timeout());
    if let Some(api_key) = config.octoprint.api_key.as_deref() {
        builder = builder.api_key(api_key);
    }
    Ok(builder.build()?)
}
