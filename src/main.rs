use color_eyre::{eyre::eyre, Result};
use padhub::config::HubSettings;
use padhub::driver::{DeviceDriver, HidApiPort, HidPort};
use padhub::session::{ChannelTransport, ClientCommand, SessionEngine, SessionHandle};
use padhub::signal::LinearizationTable;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DRIVER_EVENT_CAPACITY: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    setup_error_reporting()?;

    let settings_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = HubSettings::load(settings_path.as_deref()).await?;
    setup_logging_env(&settings.log_level);
    debug!("Running with {:?}", settings);

    let table = Arc::new(LinearizationTable::new(settings.driver.max_sensor_value));
    let port: Arc<dyn HidPort> =
        Arc::new(HidApiPort::new().map_err(|e| eyre!("Failed to open HID subsystem: {}", e))?);
    let transport = Arc::new(ChannelTransport::new(settings.session.peer_buffer));

    let (engine, session) = SessionEngine::new(transport.clone(), settings.session.clone());
    let (driver_tx, driver_rx) = mpsc::channel(DRIVER_EVENT_CAPACITY);
    let driver = DeviceDriver::spawn(port, settings.driver.clone(), table, driver_tx);
    let engine_task = tokio::spawn(engine.run(driver_rx));

    let stdio_peer = tokio::spawn(serve_stdio(transport, session.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
        }
        peer = stdio_peer => match peer {
            Ok(Ok(())) => info!("Input closed, shutting down"),
            Ok(Err(e)) => error!("Stdio peer failed: {}", e),
            Err(e) => error!("Stdio peer task failed: {}", e),
        },
    }

    if let Err(e) = session.shutdown().await {
        warn!("Session engine already stopped: {}", e);
    }
    engine_task
        .await
        .map_err(|e| eyre!("Session engine task failed: {}", e))?;
    driver.shutdown().await;

    Ok(())
}

/// Serves one peer over stdin/stdout, one JSON message per line.
async fn serve_stdio(transport: Arc<ChannelTransport>, session: SessionHandle) -> Result<()> {
    let (peer, mut outbox) = transport.connect();
    session.peer_connected(peer).await?;

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbox.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialize {:?}: {}", message, e);
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err()
            {
                warn!("Stdout closed");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientCommand>(&line) {
            Ok(command) => session.command(peer, command).await?,
            Err(e) => warn!("Ignoring malformed command: {}", e),
        }
    }

    session.peer_disconnected(peer).await?;
    transport.disconnect(peer);
    writer.abort();
    Ok(())
}

fn setup_error_reporting() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(log_level: &str) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", log_level)
    }
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    // stdout belongs to the stdio peer
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}
