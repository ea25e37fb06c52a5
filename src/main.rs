use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    serve::Listener,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use nexus::{
    ConfigCenter, ConfigValidator, GatewayHandler, GracefulShutdown, HealthProber, ProxyEngine,
    ProxyEngineOptions, SnapshotStore,
    adapters::middleware::{
        self, AuthMiddleware, LoggingMiddleware, MetricsMiddleware, Middleware,
        RateLimitMiddleware, RequestIdMiddleware, TraceContextMiddleware,
    },
    config::{ConfigWatcher, models::Config},
    core::{
        auth::{ApiKeyAuthenticator, Authenticator},
        rate_limiter::SlidingWindowLimiter,
    },
    metrics,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::ShutdownReason,
};
use serde_json::json;
use tokio::{io::{AsyncRead, AsyncWrite}, net::TcpListener};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (falls back to $NEXUS_CONFIG, then configs/nexus.yaml)
    #[clap(short, long, env = "NEXUS_CONFIG", default_value = "configs/nexus.yaml")]
    config: String,

    /// Log filter directive, e.g. "info" or "nexus=debug,info"
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Log output format: "json" or "pretty"
    #[clap(long, default_value = "json")]
    log_format: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, env = "NEXUS_CONFIG", default_value = "configs/nexus.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, env = "NEXUS_CONFIG", default_value = "configs/nexus.yaml")]
        config: String,
    },
}

/// Bridges an accept stream (TLS handshakes included) into an axum listener.
struct StreamListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for StreamListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Local newtype so we can implement `Connected` for our custom `StreamListener`
/// without running afoul of the orphan rules (axum's `Connected` and `SocketAddr`
/// are both foreign to this crate).
#[derive(Clone, Copy)]
struct StreamConnectInfo(SocketAddr);

impl<S, I, E> axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, StreamListener<S>>>
    for StreamConnectInfo
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn connect_info(target: axum::serve::IncomingStream<'_, StreamListener<S>>) -> Self {
        StreamConnectInfo(*target.remote_addr())
    }
}

/// Re-exposes the connection's real remote address as `ConnectInfo<SocketAddr>`
/// so downstream handlers/middleware can extract it the same way as on the
/// plain TCP listener.
async fn reinsert_socket_addr_connect_info(
    axum::extract::ConnectInfo(StreamConnectInfo(addr)): axum::extract::ConnectInfo<
        StreamConnectInfo,
    >,
    mut req: Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(axum::extract::ConnectInfo(addr));
    next.run(req).await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let log_level = args.log_level.clone();
    let json_logs = args.log_format != "pretty";
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_config_command(&config_path).await;
    }

    tracing_setup::init_tracing_with_config(&log_level, json_logs)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");

    let store = Arc::new(SnapshotStore::new());
    let center = Arc::new(ConfigCenter::new(Arc::clone(&store)));
    center
        .load_from_file(&config_path)
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    let config = center
        .current_config()
        .ok_or_else(|| eyre!("no configuration published after initial load"))?;

    let engine: Arc<dyn HttpClient> = Arc::new(
        ProxyEngine::new(ProxyEngineOptions::default())
            .context("Failed to create proxy engine")?,
    );

    // Standard middleware order: request-id, trace-context, logging, metrics,
    // rate-limit, auth. The optional ones join only when configured.
    let mut middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(RequestIdMiddleware),
        Arc::new(TraceContextMiddleware),
        Arc::new(LoggingMiddleware),
    ];
    if config.metrics.enabled {
        middlewares.push(Arc::new(MetricsMiddleware));
    }
    if config.rate_limit.enabled && config.rate_limit.rate > 0 {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            config.rate_limit.rate,
            config.rate_limit.window,
        ));
        middlewares.push(Arc::new(RateLimitMiddleware::new(
            limiter,
            config.rate_limit.key_func,
        )));
        tracing::info!(
            rate = config.rate_limit.rate,
            window = ?config.rate_limit.window,
            "rate limiting enabled"
        );
    }
    if config.auth.api_key.enabled && !config.auth.api_key.keys.is_empty() {
        let authenticator = Arc::new(Authenticator::ApiKey(ApiKeyAuthenticator::new(
            config.auth.api_key.keys.clone(),
        )));
        middlewares.push(Arc::new(AuthMiddleware::new(authenticator)));
        tracing::info!(keys = config.auth.api_key.keys.len(), "API key authentication enabled");
    }

    let gateway = Arc::new(GatewayHandler::new(Arc::clone(&store), Arc::clone(&engine)));
    let handler = middleware::chain(gateway.into_handler(), &middlewares);

    let ready = Arc::new(AtomicBool::new(false));
    let app = data_plane_router(&config, handler, Arc::clone(&ready));

    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(
        config.server.shutdown_timeout,
    ));
    {
        let signal_handler = Arc::clone(&graceful_shutdown);
        tokio::spawn(async move {
            if let Err(e) = signal_handler.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });
    }

    // Admin API (and metrics) listener.
    if config.admin.enabled && !config.admin.listen.is_empty() {
        let admin_router = nexus::adapters::admin::router(Arc::clone(&center));
        let admin_listen = config.admin.listen.clone();
        tokio::spawn(async move {
            match TcpListener::bind(&admin_listen).await {
                Ok(listener) => {
                    tracing::info!(listen = %admin_listen, "admin API starting");
                    if let Err(e) = axum::serve(listener, admin_router).await {
                        tracing::error!("admin server error: {}", e);
                    }
                }
                Err(e) => tracing::error!(listen = %admin_listen, "admin bind failed: {}", e),
            }
        });
    }

    // Active health prober.
    let prober_handle = {
        let prober = HealthProber::new(Arc::clone(&store), Arc::clone(&engine));
        tokio::spawn(async move { prober.run().await })
    };

    // Config watcher with debounce; failures keep the last-good snapshot.
    spawn_config_watcher(&config_path, Arc::clone(&center), &graceful_shutdown)?;

    // Optional TLS listener.
    if let Some(tls) = config.server.tls.clone().filter(|t| t.enabled) {
        let tls_app = app.clone();
        let gs = Arc::clone(&graceful_shutdown);
        tokio::spawn(async move {
            if let Err(e) = serve_tls(tls, tls_app, gs).await {
                tracing::error!("TLS server error: {:?}", e);
            }
        });
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;
    tracing::info!(listen = %config.server.listen, "nexus gateway starting");
    ready.store(true, Ordering::Relaxed);

    // Serve until a shutdown signal, then drain within the configured bound.
    let shutdown_for_server = Arc::clone(&graceful_shutdown);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_for_server.wait_for_shutdown_signal().await;
    });
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server_task => {
            result.context("server task panicked")?.context("Server error")?;
        }
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", reason);
            ready.store(false, Ordering::Relaxed);

            match tokio::time::timeout(graceful_shutdown.drain_timeout(), &mut server_task).await {
                Ok(result) => {
                    result.context("server task panicked")?.context("Server error")?;
                    tracing::info!("in-flight requests drained");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout = ?graceful_shutdown.drain_timeout(),
                        "drain timeout exceeded, forcing shutdown"
                    );
                    server_task.abort();
                    let _ = graceful_shutdown.trigger_shutdown(ShutdownReason::Force);
                }
            }
        }
    }

    prober_handle.abort();
    tracing::info!("nexus gateway stopped");
    Ok(())
}

/// Data-plane router: health probes, optional metrics exposition, and the
/// middleware chain as the fallback for everything else.
fn data_plane_router(
    config: &Config,
    handler: middleware::Handler,
    ready: Arc<AtomicBool>,
) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz).with_state(ready));

    if config.metrics.enabled {
        let path = if config.metrics.path.is_empty() {
            "/metrics".to_string()
        } else {
            config.metrics.path.clone()
        };
        app = app.route(&path, get(render_metrics));
    }

    app.fallback(move |req: Request<Body>| {
        let handler = handler.clone();
        async move { handler(req).await }
    })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> impl IntoResponse {
    if ready.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready" })),
        )
    }
}

async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

fn spawn_config_watcher(
    config_path: &str,
    center: Arc<ConfigCenter>,
    graceful_shutdown: &GracefulShutdown,
) -> Result<()> {
    let mut watcher =
        ConfigWatcher::new(config_path).context("Failed to create config watcher")?;
    let mut shutdown_rx = graceful_shutdown.subscribe();
    let config_path = config_path.to_string();
    let debounce = Duration::from_secs(2);

    tokio::spawn(async move {
        tracing::info!("config watcher task started");
        let mut last_reload = tokio::time::Instant::now()
            .checked_sub(debounce)
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            tokio::select! {
                changed = watcher.changed() => {
                    if changed.is_none() {
                        break;
                    }
                    if last_reload.elapsed() < debounce {
                        tracing::debug!("debouncing config reload event");
                        watcher.drain();
                        continue;
                    }
                    last_reload = tokio::time::Instant::now();

                    tracing::info!(path = %config_path, "reloading configuration");
                    match center.load_from_file(&config_path).await {
                        Ok(version) => {
                            tracing::info!(version, "configuration reloaded");
                        }
                        Err(e) => {
                            tracing::error!(
                                "failed to reload configuration: {e:#}. Keeping current snapshot."
                            );
                        }
                    }
                    watcher.drain();
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::info!("config watcher task stopped");
    });
    Ok(())
}

/// Serve the data plane over TLS with the configured certificate.
async fn serve_tls(
    tls: nexus::config::models::TlsConfig,
    app: Router,
    graceful_shutdown: Arc<GracefulShutdown>,
) -> Result<()> {
    use std::{fs::File, io::BufReader};

    use rustls_pemfile::{certs, pkcs8_private_keys};
    use tls_listener::TlsListener;

    let cert_file =
        &mut BufReader::new(File::open(&tls.cert_file).context("failed to open cert file")?);
    let key_file =
        &mut BufReader::new(File::open(&tls.key_file).context("failed to open key file")?);

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("No PKCS#8 private key found in key file"))?;

    let versions: &[&rustls::SupportedProtocolVersion] = if tls.min_version == "1.3" {
        &[&rustls::version::TLS13]
    } else {
        rustls::ALL_VERSIONS
    };
    let server_config = rustls::ServerConfig::builder_with_protocol_versions(versions)
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())?;

    let listener = TcpListener::bind(&tls.listen)
        .await
        .with_context(|| format!("Failed to bind TLS listener to {}", tls.listen))?;
    let local_addr = listener.local_addr().context("Failed to get local addr")?;

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let stream = TlsListener::new(acceptor, listener)
        .map(|res| res.map(|(io, addr)| (io, addr)))
        .boxed();

    let tls_listener = StreamListener { stream, local_addr };
    let app = app.layer(axum::middleware::from_fn(reinsert_socket_addr_connect_info));

    tracing::info!(listen = %tls.listen, "HTTPS server starting");
    tokio::select! {
        result = std::future::IntoFuture::into_future(axum::serve(
            tls_listener,
            app.into_make_service_with_connect_info::<StreamConnectInfo>(),
        )) => {
            result.context("TLS server error")
        }
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("TLS server stopping: {:?}", reason);
            Ok(())
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use nexus::config::loader::load_config;

    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Summary:");
            println!("   Listen Address: {}", config.server.listen);
            println!(
                "   Routes: {}",
                config.routes.len() + config.routes_v2.len()
            );
            println!(
                "   Clusters: {}",
                config.clusters.len() + config.upstreams.len()
            );
            println!(
                "   TLS Enabled: {}",
                config.server.tls.as_ref().is_some_and(|t| t.enabled)
            );
            println!("   Admin API: {}", config.admin.enabled);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
