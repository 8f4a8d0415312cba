//! ImageGate runner
//!
//! Reads one JSON [`GenerationRequest`] per line from stdin and writes one
//! JSON result per line to stdout.  Configuration comes from the file named
//! by the first argument, or defaults when none is given.
//!
//! Logging goes to stderr.  `RUST_LOG` sets the filter and
//! `IMAGEGATE_LOG_JSON=1` switches to JSON output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, watch};
use tokio_stream::wrappers::LinesStream;

use imagegate_service::clock::SystemClock;
use imagegate_service::config::GatewayConfig;
use imagegate_service::orchestrator::RequestOrchestrator;
use imagegate_service::providers::HttpBackend;
use imagegate_service::request::GenerationRequest;

/// Requests in flight at once.
const CONCURRENCY: usize = 8;

/// How long the runtime waits for the blocking stdin reader on exit.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Shutdown signal for graceful termination
struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.tx),
        }
    }
}

#[derive(Clone)]
struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn request(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once shutdown has been requested.
    async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The handle owns a sender, so the channel cannot close under us.
        if rx.wait_for(|requested| *requested).await.is_err() {
            tracing::warn!("shutdown channel closed");
        }
    }
}

/// Initialize structured logging with tracing
fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("IMAGEGATE_LOG_JSON").is_ok_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config() -> Result<GatewayConfig> {
    match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load(&path).with_context(|| format!("loading {path}")),
        None => {
            tracing::warn!("no config file given, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

/// Main runner logic
async fn run(orchestrator: Arc<RequestOrchestrator>, shutdown: ShutdownHandle) -> Result<()> {
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    lines
        .take_until(shutdown.requested())
        .for_each_concurrent(CONCURRENCY, |line| {
            let orchestrator = Arc::clone(&orchestrator);
            let stdout = Arc::clone(&stdout);
            async move {
                let line = match line {
                    Ok(line) if line.trim().is_empty() => return,
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read stdin");
                        return;
                    }
                };
                let reply = match serde_json::from_str::<GenerationRequest>(&line) {
                    Ok(request) => match orchestrator.execute(&request).await {
                        Ok(output) => json!({ "ok": output }),
                        Err(err) => json!({ "error": err }),
                    },
                    Err(e) => json!({ "error": { "kind": "invalid_request", "message": e.to_string() } }),
                };
                let mut out = stdout.lock().await;
                let mut bytes = reply.to_string().into_bytes();
                bytes.push(b'\n');
                if let Err(e) = out.write_all(&bytes).await {
                    tracing::error!(error = %e, "failed to write result");
                }
                if let Err(e) = out.flush().await {
                    tracing::error!(error = %e, "failed to flush result");
                }
            }
        })
        .await;

    Ok(())
}

fn main() -> Result<()> {
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let result = runtime.block_on(serve());
    // A pending stdin read sits on a blocking thread; do not wait on it.
    runtime.shutdown_timeout(EXIT_GRACE);
    result
}

async fn serve() -> Result<()> {
    let config = load_config()?;
    let backend = HttpBackend::with_proxy(config.proxy_url.as_deref())
        .context("building HTTP client")?;
    let orchestrator =
        RequestOrchestrator::from_config(&config, Arc::new(backend), Arc::new(SystemClock))
            .context("building credential store")?;
    tracing::info!(
        presets = config.presets.len(),
        current = ?orchestrator.store().current(),
        "ImageGate starting"
    );

    // Set up shutdown handling
    let shutdown = Shutdown::new();

    // Set up signal handlers
    let shutdown_clone = shutdown.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down...");
                shutdown_clone.request();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to set up Ctrl+C handler");
            }
        }
    });

    // Handle SIGTERM on Unix
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let shutdown_clone = shutdown.handle();
        tokio::spawn(async move {
            let mut term = signal(SignalKind::terminate())?;
            term.recv().await;
            tracing::info!("Received SIGTERM, shutting down...");
            shutdown_clone.request();
            anyhow::Ok(())
        });
    }

    let orchestrator = Arc::new(orchestrator);
    run(Arc::clone(&orchestrator), shutdown.handle()).await?;

    let stats = serde_json::to_string(&orchestrator.stats().snapshot())?;
    tracing::info!(%stats, "final stats");
    tracing::info!("ImageGate stopped");
    Ok(())
}
