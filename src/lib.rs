pub mod config;
pub mod handshake;
pub mod http;
pub mod session_tasks;

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use self::config::Config;
use service::{Hub, HubConfig};

pub const SOFTWARE: &str = concat!("pinch-relay.", env!("CARGO_PKG_VERSION"));

/// Shared state handed to every HTTP handler and client session task.
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub keys: store::KeyRegistry,
    pub register_limiter: service::RateLimiter,
    pub http_client: reqwest::Client,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
    /// Count of currently-spawned per-session tasks (3 per live session);
    /// reported on `/health` as `goroutines`, the name the reference relay
    /// uses for the same figure.
    pub active_tasks: Arc<AtomicUsize>,
}

/// In order to let integration tests directly use the pinch-relay crate and
/// start the server, a function is opened to replace `main` so it can be
/// driven without a process boundary.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    let store = store::Store::open(&config.relay_db_path)
        .with_context(|| format!("opening durable store at {}", config.relay_db_path))?;

    let hub = Arc::new(Hub::new(
        store.blocks().context("opening block store")?,
        store.queue().context("opening message queue")?,
        HubConfig {
            queue_max_per_agent: config.queue_max_per_agent,
            queue_ttl_nanos: config.queue_ttl_nanos(),
            flush_batch_size: 50,
            rate_limit_sustained: config.rate_limit_sustained,
            rate_limit_burst: config.rate_limit_burst,
        },
    ));

    let keys = store.keys().context("opening key registry")?;
    let queue_for_sweep = store.queue().context("opening message queue for sweeper")?;
    let keys_for_sweep = store.keys().context("opening key registry for sweeper")?;

    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState {
        config: config.clone(),
        hub,
        keys,
        register_limiter: service::RateLimiter::new(config.register_rate_limit, config.register_rate_burst),
        http_client: reqwest::Client::new(),
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
        active_tasks: Arc::new(AtomicUsize::new(0)),
    });

    spawn_queue_sweeper(queue_for_sweep, config.queue_ttl_nanos(), shutdown.clone());
    spawn_pending_sweeper(
        keys_for_sweep,
        config.pending_key_ttl_nanos(),
        config.pending_sweep_interval_minutes,
        shutdown.clone(),
    );

    let app = http::router(state);
    let listener = TcpListener::bind(("0.0.0.0", config.relay_port))
        .await
        .with_context(|| format!("binding port {}", config.relay_port))?;
    log::info!("{SOFTWARE} listening on :{}", config.relay_port);

    let serving = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(drain(shutdown.clone()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown signal received, draining sessions");
            shutdown.cancel();
        }
    });

    // §5: a 10s drain deadline. The signal future resolves the instant
    // `shutdown` is cancelled so axum stops accepting new connections right
    // away; this timeout only bounds how long in-flight sessions get to
    // finish before the process exits anyway.
    match tokio::time::timeout(std::time::Duration::from_secs(10), serving).await {
        Ok(result) => result.context("http server error")?,
        Err(_) => log::warn!("graceful shutdown timed out after 10s, forcing exit"),
    }

    store.flush().context("flushing durable store on shutdown")?;
    Ok(())
}

async fn drain(shutdown: CancellationToken) {
    shutdown.cancelled().await;
}

fn spawn_queue_sweeper(queue: store::MessageQueue, ttl_nanos: i64, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = now_nanos();
                    match queue.sweep(now, ttl_nanos) {
                        Ok(cleaned) => {
                            for (recipient, count) in cleaned {
                                if count > 0 {
                                    log::info!("queue sweep: removed {count} expired entries for {recipient}");
                                }
                            }
                        }
                        Err(e) => log::warn!("queue sweep failed: {e}"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

fn spawn_pending_sweeper(
    keys: store::KeyRegistry,
    ttl_nanos: i64,
    interval_minutes: u64,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_minutes * 60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = now_nanos();
                    match keys.sweep_pending(now, ttl_nanos) {
                        Ok(cleaned) if cleaned > 0 => log::info!("pending-key sweep: removed {cleaned} expired records"),
                        Ok(_) => {}
                        Err(e) => log::warn!("pending-key sweep failed: {e}"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
