//! tazer-server
//!
//! One process, one [`CacheHierarchy`] (§4.10): memory, optionally
//! shared-memory and bounded-filelock tiers, terminated by a
//! [`tazer::servefile::LocalFileOrigin`]. Every accepted connection gets its
//! own task; every task shares the same hierarchy and the same
//! [`FileCacheRegister`]/[`TrackableRegistry`] pair, so two clients opening
//! the same path see the same [`ServeFile`] and the same cached blocks.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tazer::cache::backend::filelock::FilelockBackend;
use tazer::cache::backend::local_file::LocalFileBackend;
use tazer::cache::backend::memory::MemoryBackend;
use tazer::cache::backend::shared_memory::SharedMemoryBackend;
use tazer::cache::bounded::BoundedCache;
use tazer::cache::hierarchy::HierarchyTier;
use tazer::servefile::LocalFileOrigin;
use tazer::wire::Message;
use tazer::{
    CacheHierarchy, Error, FileCacheRegister, PriorityThreadPool, Result, ServeFile, ServeFileConfig, ServerConfig,
    TrackableRegistry,
};

/// Everything an accepted connection's task needs a handle to.
struct ServerState {
    hierarchy: Arc<CacheHierarchy>,
    register: FileCacheRegister,
    trackables: TrackableRegistry,
    config: ServeFileConfig,
    /// Shared across every `ServeFile` (C8): one bounded pool for outgoing
    /// block compression, sized by `ServerConfig::num_server_comp_threads`.
    compress_pool: PriorityThreadPool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_logging(&config.log_format);

    info!(version = tazer::VERSION, listen_addr = %config.listen_addr, "starting tazer-server");

    let hierarchy = Arc::new(build_hierarchy(&config)?);
    let state = Arc::new(ServerState {
        hierarchy: hierarchy.clone(),
        register: FileCacheRegister::new(),
        trackables: TrackableRegistry::new(),
        config: ServeFileConfig {
            block_size: config.server_block_size,
            initial_prefetch_blocks: 0,
            compress_outgoing: true,
        },
        compress_pool: PriorityThreadPool::new("server-compress", config.num_server_comp_threads),
    });

    if let Some(metrics_addr) = config.metrics_addr.clone() {
        let hierarchy = hierarchy.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr, hierarchy).await {
                error!(error = %e, "metrics server exited");
            }
        });
    }

    run_accept_loop(&config.listen_addr, state).await
}

/// Build the server's one tier stack (§4.10): memory always enabled,
/// local-file, shared-memory and bounded-filelock opt-in per `ServerConfig`,
/// terminated by a disk-reading [`LocalFileOrigin`].
fn build_hierarchy(config: &ServerConfig) -> Result<CacheHierarchy> {
    let mut tiers: Vec<Box<dyn HierarchyTier>> = Vec::new();

    let mem_blocks = (config.server_cache_size / config.server_block_size.max(1)).max(1) as usize;
    let memory = MemoryBackend::new("l1-memory", mem_blocks, config.server_block_size);
    tiers.push(Box::new(BoundedCache::new(memory, config.server_associativity)));

    if config.enable_local_file_cache {
        let lf_blocks = (config.local_file_cache_size / config.local_file_cache_block_size.max(1)).max(1) as usize;
        let local_file = LocalFileBackend::new(
            "l1b-local-file",
            config.local_file_cache_path.clone(),
            lf_blocks,
            config.local_file_cache_block_size,
        )?;
        tiers.push(Box::new(BoundedCache::new(local_file, config.local_file_cache_associativity)));
    }

    if config.enable_shm_cache {
        let shm_blocks = (config.shared_memory_cache_size / config.shared_memory_cache_block_size.max(1)).max(1) as usize;
        let shm = SharedMemoryBackend::create_or_open("l2-shm", shm_blocks, config.shared_memory_cache_block_size)?;
        // Another process that held this segment may have died with blocks
        // still marked active; sweep before this process starts serving.
        shm.recover_orphaned_active_counts(is_pid_alive);
        tiers.push(Box::new(BoundedCache::new(shm, config.shared_memory_cache_associativity)));
    }

    if config.enable_filelock_cache {
        let fl_blocks =
            (config.bounded_filelock_cache_size / config.bounded_filelock_cache_block_size.max(1)).max(1) as usize;
        let filelock = FilelockBackend::open(
            "l3-filelock",
            config.filelock_cache_path.clone(),
            fl_blocks,
            config.bounded_filelock_cache_block_size,
            config.bounded_filelock_cache_associativity,
        )?;
        filelock.recover_stale_active_bits(is_pid_alive)?;
        tiers.push(Box::new(BoundedCache::new(filelock, config.bounded_filelock_cache_associativity)));
    }

    let origin = LocalFileOrigin::new(config.server_block_size);
    Ok(CacheHierarchy::new(tiers, Some(Box::new(origin))))
}

/// Whether a process with this pid is still running, used by the
/// shared-memory and filelock tiers' startup crash-recovery sweeps to tell
/// a stale hold from a live one.
fn is_pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn run_accept_loop(listen_addr: &str, state: Arc<ServerState>) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid listen_addr {listen_addr}: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "accept loop listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &state).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// §4.10: one task per connection, dispatching on wire message kind. Each
/// connection tracks its own `path -> ServeFile` map purely to avoid a
/// registry lookup per request; the underlying `ServeFile` is still the one
/// shared singleton every connection that opened the same path sees.
async fn handle_connection(mut socket: TcpStream, state: &ServerState) -> Result<()> {
    let mut open_files: std::collections::HashMap<String, Arc<ServeFile>> = std::collections::HashMap::new();

    loop {
        let message = match Message::read_from(&mut socket).await {
            Ok(m) => m,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        match message {
            Message::OpenFile { path } => {
                let reply = match open_file(state, &path).await {
                    Ok(serve_file) => {
                        let size = serve_file.size();
                        open_files.insert(path.clone(), serve_file);
                        Message::OpenFileReply { path, size: Some(size) }
                    }
                    Err(e) => {
                        warn!(%path, error = %e, "open failed");
                        Message::OpenFileReply { path, size: None }
                    }
                };
                reply.write_to(&mut socket).await?;
            }
            Message::RequestBlock { path, blk, want_compressed } => {
                let serve_file = match open_files.get(&path) {
                    Some(f) => f.clone(),
                    None => {
                        let f = open_file(state, &path).await?;
                        open_files.insert(path.clone(), f.clone());
                        f
                    }
                };
                let (compression, data) = serve_file.serve_block(blk, want_compressed).await?;
                Message::SendBlock { path, blk, compression, data }.write_to(&mut socket).await?;
            }
            Message::CloseFile { path } => {
                if let Some(serve_file) = open_files.remove(&path) {
                    serve_file.drain_writes().await;
                }
            }
            other @ (Message::OpenFileReply { .. } | Message::SendBlock { .. }) => {
                return Err(Error::MalformedFrame(format!("client sent a server-only message: {other:?}")));
            }
        }
    }
}

async fn open_file(state: &ServerState, path: &str) -> Result<Arc<ServeFile>> {
    if let Some(existing) = state.trackables.get::<ServeFile>(path) {
        return Ok(existing);
    }
    let file_index = state.register.register(path)?;
    let serve_file = ServeFile::open(
        path.to_string(),
        file_index,
        state.hierarchy.clone(),
        state.config,
        state.compress_pool.clone(),
    )
    .await?;
    Ok(state.trackables.get_or_insert(path, serve_file))
}

fn init_logging(log_format: &str) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if log_format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true)).init();
    }
}

/// §10.5: per-tier hit/miss/eviction counters as a Prometheus `GaugeVec`
/// family, labeled by tier name. The tier set is fixed for the process's
/// lifetime, so re-populating the same vec on every scrape (rather than
/// registering fresh gauges per request, the way a fixed metric name would)
/// is enough.
async fn run_metrics_server(addr: &str, hierarchy: Arc<CacheHierarchy>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let hits = prometheus::register_gauge_vec!("tazer_tier_hits_total", "Hits per cache tier", &["tier"])
        .map_err(|e| Error::Internal(e.to_string()))?;
    let misses = prometheus::register_gauge_vec!("tazer_tier_misses_total", "Misses per cache tier", &["tier"])
        .map_err(|e| Error::Internal(e.to_string()))?;
    let evictions =
        prometheus::register_gauge_vec!("tazer_tier_evictions_total", "Evictions per cache tier", &["tier"])
            .map_err(|e| Error::Internal(e.to_string()))?;
    let wasted = prometheus::register_gauge_vec!(
        "tazer_tier_wasted_fetches_total",
        "Wasted fetches per cache tier",
        &["tier"]
    )
    .map_err(|e| Error::Internal(e.to_string()))?;

    let make_svc = make_service_fn(move |_conn| {
        let hierarchy = hierarchy.clone();
        let hits = hits.clone();
        let misses = misses.clone();
        let evictions = evictions.clone();
        let wasted = wasted.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let hierarchy = hierarchy.clone();
                let hits = hits.clone();
                let misses = misses.clone();
                let evictions = evictions.clone();
                let wasted = wasted.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let snapshot = hierarchy.metrics_snapshot();
                            for (tier, t) in &snapshot.tiers {
                                hits.with_label_values(&[tier]).set(t.hits as f64);
                                misses.with_label_values(&[tier]).set(t.misses as f64);
                                evictions.with_label_values(&[tier]).set(t.evictions as f64);
                                wasted.with_label_values(&[tier]).set(t.wasted_fetches as f64);
                            }

                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            encoder.encode(&metric_families, &mut buffer).unwrap();
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap()
                        }
                        "/healthz" => {
                            Response::builder().status(StatusCode::OK).body(Body::from("ok")).unwrap()
                        }
                        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("not found")).unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr =
        addr.parse().map_err(|e| Error::Configuration(format!("invalid metrics_addr {addr}: {e}")))?;
    info!(%addr, "metrics server listening");
    Server::bind(&addr).serve(make_svc).await.map_err(|e| Error::Internal(e.to_string()))?;
    Ok(())
}
