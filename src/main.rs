//! block-streamer: headless volume block streaming service.
//!
//! Loads (or builds) the block index for a raw volume, starts the background
//! loader and a headless render loop that pumps uploads every frame, and
//! exposes stats and classification control over HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use block_streamer::cache::block::BlockSet;
use block_streamer::config::{Cli, Config, StreamingConfig};
use block_streamer::gpu::HeadlessBackend;
use block_streamer::server::api::{build_router, AppState};
use block_streamer::server::metrics::StreamerMetrics;
use block_streamer::streaming::{BlockCollection, BlockLoader};
use block_streamer::transfer::disk_io::BlockReader;
use block_streamer::volume::{VolumeError, VolumeGeometry, VolumeIndex};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "block_streamer=debug,tower_http=debug"
    } else {
        "block_streamer=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("block-streamer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    config.validate()?;
    let geometry = config.geometry()?;

    info!(
        data = %config.volume.data_path.display(),
        data_type = %config.volume.data_type,
        dims = ?config.volume.dims,
        block_count = ?config.volume.block_count,
        "Configuration loaded"
    );
    info!(
        max_cpu_blocks = config.streaming.max_cpu_blocks,
        max_gpu_blocks = config.streaming.max_gpu_blocks,
        upload_budget_ms = config.streaming.upload_budget_ms,
        "Tier capacities"
    );

    // Block index and block set.
    let index = load_or_scan_index(&config, geometry, cli.scan)?;
    let blocks = Arc::new(BlockSet::from_index(&index));
    let reader = BlockReader::open(
        &config.volume.data_path,
        index.data_type,
        geometry,
        index.value_min,
        index.value_max,
    )?;

    // Loader and collection.
    let mut backend = HeadlessBackend::new();
    let loader = BlockLoader::new(blocks, reader, config.streaming.limits(), &mut backend)?;
    loader.set_eviction_hook(Box::new(|block_id, texture| {
        debug!(block_id, texture = %texture, "Texture reclaimed by GPU tier");
    }));

    let collection = Arc::new(BlockCollection::new(loader));
    collection.start()?;

    let c = &config.classification;
    let shown = collection.set_classification(c.kind, c.low, c.high)?;
    info!(kind = %c.kind, low = c.low, high = c.high, shown, "Initial classification");

    // Headless render loop.
    let stop = Arc::new(AtomicBool::new(false));
    let render = spawn_render_loop(
        Arc::clone(&collection),
        backend,
        &config.streaming,
        Arc::clone(&stop),
    )?;

    // Build application state and router.
    let state = Arc::new(AppState {
        collection: Arc::clone(&collection),
        metrics: StreamerMetrics::new()?,
        start_time: Instant::now(),
    });
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen.unwrap_or_else(|| config.server.listen.clone());
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Tear down: render loop first, then the loader and textures.
    stop.store(true, Ordering::Release);
    let mut backend = render
        .join()
        .map_err(|_| anyhow!("render thread panicked"))?;
    let released = collection.shutdown(&mut backend);

    info!(
        released,
        uploads = backend.total_uploads(),
        bytes = backend.total_bytes(),
        "Shutdown complete"
    );
    Ok(())
}

/// Load the index next to the raw file, or scan the raw file when asked to.
fn load_or_scan_index(
    config: &Config,
    geometry: VolumeGeometry,
    scan: bool,
) -> anyhow::Result<VolumeIndex> {
    let path = config.volume.index_path();

    let index = if path.exists() {
        VolumeIndex::load(&path)?
    } else if scan {
        info!(raw = %config.volume.data_path.display(), "Scanning raw volume to build index");
        let index = VolumeIndex::scan(&config.volume.data_path, geometry, config.volume.data_type)?;
        index.save(&path)?;
        info!(path = %path.display(), "Saved volume index");
        index
    } else {
        bail!(
            "index {} not found; run with --scan to build it from the raw file",
            path.display()
        );
    };

    if index.data_type != config.volume.data_type {
        return Err(VolumeError::DataTypeMismatch {
            index: index.data_type,
            configured: config.volume.data_type,
        }
        .into());
    }
    if index.geometry != geometry {
        bail!(
            "index geometry {:?}/{:?} does not match configured {:?}/{:?}",
            index.geometry.dims,
            index.geometry.block_count,
            geometry.dims,
            geometry.block_count
        );
    }
    Ok(index)
}

/// Per-frame upload pump standing in for a real renderer. Hands the backend
/// back when stopped so textures can be released.
fn spawn_render_loop(
    collection: Arc<BlockCollection>,
    mut backend: HeadlessBackend,
    streaming: &StreamingConfig,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<HeadlessBackend>> {
    let budget = Duration::from_millis(streaming.upload_budget_ms);
    let interval = Duration::from_millis(streaming.frame_interval_ms);

    thread::Builder::new()
        .name("render".to_string())
        .spawn(move || {
            let mut frames = 0u64;
            while !stop.load(Ordering::Acquire) {
                let frame_start = Instant::now();
                let report = collection.load_some_blocks(&mut backend, budget);
                let drawn = collection.visible_gpu_resident_blocks().len();
                frames += 1;

                if report.uploaded > 0 || report.failed > 0 {
                    debug!(
                        frame = frames,
                        uploaded = report.uploaded,
                        failed = report.failed,
                        remaining = report.remaining,
                        drawn,
                        "Frame"
                    );
                }

                if let Some(rest) = interval.checked_sub(frame_start.elapsed()) {
                    thread::sleep(rest);
                }
            }
            info!(frames, "Render loop stopped");
            backend
        })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
}
