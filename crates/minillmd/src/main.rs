//! minillmd: the training and inference daemon.
//!
//! Speaks newline-delimited JSON over TCP. A connection whose first request
//! is `Subscribe` becomes a one-way stream of training events.

mod error;
mod files;
mod handlers;
mod paths;
mod protocol;
mod recorder;
mod registry;
mod state;
mod store;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use handlers::SharedState;
use paths::AppPaths;
use protocol::{Request, Response};
use registry::EventBus;
use state::DaemonState;
use store::Store;

pub const ADDR_ENV: &str = "MINILLMD_ADDR";
pub const DEFAULT_ADDR: &str = "127.0.0.1:9877";
const EVENT_BUFFER: usize = 256;

async fn write_line<T: serde::Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    writer
        .write_all(serde_json::to_string(value)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

async fn stream_events(
    mut writer: OwnedWriteHalf,
    state: SharedState,
    config_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut rx = state.read().await.bus.subscribe();
    write_line(
        &mut writer,
        &Response::Subscribed {
            config_id: config_id.clone(),
        },
    )
    .await?;

    loop {
        match rx.recv().await {
            Ok(ev) => {
                if config_id.as_deref().is_some_and(|c| c != ev.config_id) {
                    continue;
                }
                write_line(&mut writer, &ev).await?;
            }
            Err(RecvError::Lagged(n)) => {
                debug!(skipped = n, "subscriber lagged");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("Invalid request: {e}"),
                };
                write_line(&mut writer, &resp).await?;
                continue;
            }
        };

        if let Request::Subscribe { config_id } = request {
            return stream_events(writer, state, config_id).await;
        }

        let response = handlers::handle(&state, request).await;
        write_line(&mut writer, &response).await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    info!(dir = %paths.data_dir().display(), "data directory ready");

    let mut store = Store::open(&paths.store_file())?;
    let seeded = store.seed_presets();
    if seeded > 0 {
        info!(count = seeded, "seeded preset configs");
    }
    let (bus, events) = EventBus::new(EVENT_BUFFER);
    let state: SharedState = Arc::new(RwLock::new(DaemonState::new(paths, store, bus)));
    state.read().await.persist();

    tokio::spawn(recorder::run(Arc::clone(&state), events));

    // Save on Ctrl-C so the store survives an abrupt stop.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let s = state.read().await;
                s.registry.stop_all();
                s.persist();
                info!("Ctrl-C: store saved");
                std::process::exit(0);
            }
        });
    }

    let addr = std::env::var(ADDR_ENV).unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("minillmd listening on {addr}");

    let shutdown = Arc::clone(&state.read().await.shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "client connected");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state).await {
                        error!("client handler error: {e}");
                    }
                });
            }
            _ = shutdown.notified() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
