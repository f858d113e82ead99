mod actions;
mod driver;
mod grabber;
mod lease;
mod scheduler;
mod state_machine;

use actions::CommandActions;
use anyhow::{Context, Result};
use clap::Parser;
use driver::{ComboDriver, DriverSettings};
use keycombo_core::config::{self, Config};
use keycombo_core::ipc::{self, ClientMsg, DaemonMsg};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

#[derive(Parser, Debug)]
#[command(name = "keycombod", about = "Run an action when a key combination is held")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Alternate key set from [combo.profiles]
    #[arg(short, long, env = "KEYCOMBO_PROFILE")]
    profile: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keycombod=info".parse().context("parsing log directive")?),
        )
        .init();

    let args = Args::parse();
    info!("keycombod starting");

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().context("loading config")?,
    };
    let settings = DriverSettings::from_config(&config, args.profile.as_deref())
        .context("resolving combo keys")?;
    info!(
        down = ?settings.down,
        up = ?settings.up,
        dwell_ms = config.combo.delay_ms,
        "combo configured"
    );

    let actions = Arc::new(CommandActions::from_config(&config.actions));
    let blocker = lease::blocker_for(config.lease.backend);
    let driver = Arc::new(ComboDriver::new(&settings, actions, blocker).context("creating combo driver")?);

    // Events from every watched device funnel through one channel, keeping per-key order
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let feed = grabber::DeviceFeed::start(driver.keys(), event_tx).context("watching input devices")?;
    if feed.device_count() == 0 {
        warn!("no input device reports a tracked key yet, waiting for hot-plug");
    }
    driver.attach(Box::new(feed));

    // Start IPC listener
    let socket_path = config::socket_path();
    // Remove stale socket
    let _ = std::fs::remove_file(&socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding socket {}", socket_path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666)).ok();
    }
    info!(path = %socket_path.display(), "IPC socket listening");

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let ipc_driver = Arc::clone(&driver);
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_ipc_client(
                        stream,
                        Arc::clone(&ipc_driver),
                        stop_tx.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "IPC accept error");
                }
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            Some(ev) = event_rx.recv() => {
                trace!(device = ev.device_idx, code = ev.code, pressed = ev.pressed, "key event");
                if let Err(e) = driver.on_event(ev.code, ev.pressed) {
                    error!(error = %e, code = ev.code, "combo update failed");
                }
            }
            _ = stop_rx.recv() => {
                info!("shutdown requested over IPC");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated");
                break;
            }
        }
    }

    info!("keycombod shutting down");
    // Draining the worker can wait on a running action
    let teardown = Arc::clone(&driver);
    tokio::task::spawn_blocking(move || teardown.shutdown())
        .await
        .context("joining driver shutdown")?;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_ipc_client(stream: UnixStream, driver: Arc<ComboDriver>, stop_tx: mpsc::Sender<()>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(msg) = ipc::decode_client(&line) else {
            continue;
        };

        let reply = match msg {
            ClientMsg::GetStatus => DaemonMsg::Status {
                status: driver.status(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            ClientMsg::Shutdown => {
                info!("shutdown via IPC");
                let _ = stop_tx.try_send(());
                DaemonMsg::Ack {
                    ok: true,
                    message: "shutting down".into(),
                }
            }
        };

        if writer.write_all(ipc::encode(&reply).as_bytes()).await.is_err() {
            break;
        }
    }
}
