use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::error;
use tracing_subscriber::EnvFilter;

use steadyscript::capture;
use steadyscript::config::{AppConfig, Args};
use steadyscript::led;
use steadyscript::pipeline::{
    pipeline_loop, Pipeline, PipelineChannels, EVENT_CHANNEL_DEPTH, FRAME_CHANNEL_DEPTH,
};
use steadyscript::server::{self, AppState};
use steadyscript::store::{persistence_loop, SessionStore, PERSIST_QUEUE_DEPTH};

fn main() -> eyre::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "steadyscript=info,warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = AppConfig::from_args(&args);

    // An unavailable camera is fatal: exit non-zero before spawning anything.
    let device = capture::open_device(&cfg)?;

    let (frame_watch_tx, frame_watch_rx) = watch::channel(None);
    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_DEPTH);
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
    let (metrics_tx, metrics_rx) = watch::channel(None);
    let (persist_tx, persist_rx) = crossbeam_channel::bounded(PERSIST_QUEUE_DEPTH);
    let (led_tx, led_rx) = mpsc::channel(16);

    let history = Arc::new(RwLock::new(Vec::new()));
    let store = SessionStore::load(&cfg.sessions_file);

    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            if let Err(e) = capture::capture_loop(device, frame_watch_tx) {
                error!("capture thread exited: {e}");
            }
        })?;

    let pipeline = Pipeline::new(cfg.clone())?;
    let channels = PipelineChannels {
        frame_rx: frame_watch_rx,
        command_rx,
        frame_tx: frame_tx.clone(),
        event_tx: event_tx.clone(),
        metrics_tx,
        persist_tx,
        led_tx,
    };
    std::thread::Builder::new()
        .name("pipeline".to_string())
        .spawn(move || pipeline_loop(pipeline, channels))?;

    {
        let history = history.clone();
        let event_tx = event_tx.clone();
        std::thread::Builder::new()
            .name("persistence".to_string())
            .spawn(move || persistence_loop(store, persist_rx, history, event_tx))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("steadyscript-runtime")
        .build()?;

    runtime.block_on(async move {
        tokio::spawn(led::led_loop(cfg.led_serial_path.clone(), led_rx));
        let state = AppState {
            command_tx,
            frame_tx,
            event_tx,
            metrics_rx,
            history,
        };
        server::serve(state, &cfg.http_server_addr).await
    })?;

    Ok(())
}
