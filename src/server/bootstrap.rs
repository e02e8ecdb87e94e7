use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::proxy::Handler;
use crate::server::{self, ProxyState};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    /// Overrides the config file's listen address when set.
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Tracks the shutdown signal of the current worker generation: every
/// reload stops the previous handler's health workers and starts fresh
/// ones for the new handler.
struct WorkerGeneration {
    current: Mutex<Arc<Notify>>,
}

impl WorkerGeneration {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(Arc::new(Notify::new())),
        })
    }

    fn start(&self, handler: &Handler) -> Result<()> {
        let next = Arc::new(Notify::new());
        handler.spawn_workers(&next)?;
        let previous = std::mem::replace(&mut *self.current.lock().unwrap(), next);
        previous.notify_waiters();
        Ok(())
    }

    fn stop(&self) {
        self.current.lock().unwrap().notify_waiters();
    }
}

/// Proxy lifecycle: init → provision → serve → (reload)* → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = ProxyConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(admin) = args.admin_listen {
        config.admin_listen = admin;
    }

    let metrics = Metrics::install();

    let handler = Handler::new(&config.proxy).map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut state = ProxyState::new(handler);
    state.metrics = Some(metrics);

    let workers = WorkerGeneration::new();
    workers.start(&state.handler.load())?;

    let shutdown = Arc::new(Notify::new());

    // Admin server.
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let admin_listen = config.admin_listen.clone();
        tokio::spawn(async move {
            if let Err(e) = server::admin::run_admin_server(&admin_listen, state, shutdown).await {
                error!("server: admin failed, error={}", e);
            }
        });
    }

    start_reload_watcher(
        state.clone(),
        args.config_path.clone(),
        workers.clone(),
        &shutdown,
    );

    info!("server: starting proxy, listen={}", config.listen);
    let listener = TcpListener::bind(&config.listen).await?;
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::serve(listener, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    // Stop health workers, then close hijacked streams after the grace
    // period, then wait for the accept loop to finish draining.
    workers.stop();
    let handler = state.handler.load_full();
    handler
        .streams()
        .shutdown_all(handler.stream_close_delay())
        .await;

    if let Err(e) = proxy_handle.await {
        error!("server: proxy task error, error={}", e);
    }

    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer guard must outlive main; dropping it silences logging.
    std::mem::forget(guard);
}

/// SIGHUP rebuilds the handler from the config file and swaps it in. Host
/// state survives the swap through the process-wide registry; the old pool
/// is freed once its last in-flight request completes.
fn start_reload_watcher(
    state: ProxyState,
    config_path: PathBuf,
    workers: Arc<WorkerGeneration>,
    shutdown: &Arc<Notify>,
) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(s) => s,
                Err(e) => {
                    error!("server: reload watcher failed to install, error={}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = hup.recv() => {}
                    _ = shutdown.notified() => return,
                }

                let new_handler = ProxyConfig::load(&config_path)
                    .and_then(|cfg| Handler::new(&cfg.proxy).map_err(|e| anyhow::anyhow!("{}", e)));
                match new_handler {
                    Ok(handler) => {
                        let handler = Arc::new(handler);
                        if let Err(e) = workers.start(&handler) {
                            error!("server: reload: worker start failed, error={}", e);
                            continue;
                        }
                        state.handler.store(handler);
                        info!("server: config reloaded, pool replaced");
                    }
                    Err(e) => {
                        error!("server: reload failed, keeping old config, error={}", e);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (state, config_path, workers);
            shutdown.notified().await;
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
