mod cluster;
mod config;
mod engine;
mod handlers;
mod health;
mod metrics;
mod patch;
mod selector;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "affinity-admission",
    about = "Kubernetes admission webhook enforcing pod affinity"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        default_value = "/etc/affinity-admission/config.yaml",
        env = "AFFINITY_CONFIG"
    )]
    config: String,

    /// Address of the HTTPS webhook listener
    #[arg(long)]
    listen_addr: Option<String>,

    /// Policy mode: denyMissing, patchAlways or patchMissing
    #[arg(long)]
    mode: Option<String>,

    /// Affinity to inject, as raw JSON
    #[arg(long)]
    affinity_patch: Option<String>,

    /// Pod label selector, as a JSON-encoded LabelSelector
    #[arg(long)]
    pod_selector: Option<String>,
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            listen_addr: self.listen_addr.clone(),
            mode: self.mode.clone(),
            affinity_patch: self.affinity_patch.clone(),
            pod_selector: self.pod_selector.clone(),
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_webhook_server(
    addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    router: Router,
    ready: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind webhook listener: {e}");
            std::process::exit(1);
        }
    };

    info!(%addr, "HTTPS webhook server listening");
    ready.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }

    ready.store(false, Ordering::Relaxed);
}

async fn run_ops_server(addr: SocketAddr, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind metrics listener: {e}");
            std::process::exit(1);
        }
    };

    info!(%addr, "HTTP metrics/health server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

fn parse_addr(name: &str, value: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        error!("invalid {name} '{value}': {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let config = config::AdmissionConfig::load(&cli.config, &cli.overrides()).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let policy = engine::PolicyConfig::from_settings(&config.policy).unwrap_or_else(|e| {
        error!("invalid policy configuration: {e}");
        std::process::exit(1);
    });
    let engine = engine::AffinityEngine::new(policy);

    let rendered_patch = patch::render_patch(engine.patch()).unwrap_or_else(|e| {
        error!("failed to render affinity patch: {e}");
        std::process::exit(1);
    });
    let selector = engine
        .config()
        .pod_selector
        .as_ref()
        .filter(|s| !s.selects_all())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<all pods>".to_string());

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        log_level = %config.log_level,
        mode = %engine.config().mode,
        affinity_patch = %String::from_utf8_lossy(&rendered_patch),
        pod_selector = %selector,
        client_ca.enabled = config.client_ca.enabled,
        reject_unsupported_content_type = config.policy.reject_unsupported_content_type,
        "affinity-admission starting"
    );

    let client_ca = if config.client_ca.enabled {
        match cluster::fetch_client_ca(&config.client_ca).await {
            Ok(pem) => Some(pem),
            Err(e) => {
                error!("failed to load client CA: {e}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let cert_path = config.cert_path();
    let key_path = config.key_path();
    info!(cert = %cert_path.display(), key = %key_path.display(), "reading TLS key pair");
    let tls_config = tls::load_tls_config(&cert_path, &key_path, client_ca.as_deref())
        .unwrap_or_else(|e| {
            error!("failed to load TLS config: {e}");
            std::process::exit(1);
        });
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let mut registry = Registry::default();
    let admission_metrics = metrics::AdmissionMetrics::new(&mut registry, engine.config().mode);
    let registry = Arc::new(registry);

    let app_state = Arc::new(handlers::AppState {
        engine,
        metrics: admission_metrics,
        reject_unsupported_content_type: config.policy.reject_unsupported_content_type,
    });

    let webhook_router = Router::new()
        .route("/admit", post(handlers::handle_admit))
        .route("/mutate", post(handlers::handle_mutate))
        .route("/health", get(health::health))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let ops_state = Arc::new(health::OpsState {
        registry,
        ready: ready.clone(),
    });

    let ops_router = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .with_state(ops_state);

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let metrics_addr = parse_addr("metrics_addr", &config.metrics_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let webhook_shutdown_rx = shutdown_rx.clone();
    let ops_shutdown_rx = shutdown_rx;

    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_webhook_server(listen_addr, tls_acceptor, webhook_router, ready, webhook_shutdown_rx),
        run_ops_server(metrics_addr, ops_router, ops_shutdown_rx),
    );

    info!("affinity-admission shut down gracefully");
}
