//! Top-level lifecycle: bind, spawn, run, tear down.
//!
//! Startup binds the control and public listeners first (bind errors are
//! fatal and exit nonzero), then spawns one worker per slot. The "ready"
//! banner is the pool's business and fires once every slot has booted.
//!
//! Shutdown (SIGINT, SIGTERM, or a fatal pool fault) stops both listeners,
//! terminates every child (politely, then forcefully) and removes the
//! runtime directory. A second signal during teardown is a no-op: the
//! handlers stay installed and the teardown path runs once.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control;
use crate::dispatcher;
use crate::pool::{PoolSettings, spawn_pool};
use crate::supervisor::{ProcessSpawner, WorkerSpawner};
use crate::watcher::{self, FileSet};

/// The master process: owns listeners, the pool task, and teardown.
pub struct Lifecycle {
    config: Config,
    spawner: Option<Arc<dyn WorkerSpawner>>,
}

impl Lifecycle {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            spawner: None,
        }
    }

    /// Override the spawner (tests use a fake without real children).
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Run until the given future resolves (or the pool task faults).
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let config = self.config;

        let public = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
        let public_addr = public.local_addr().context("no local address")?;

        let runtime_dir = runtime_dir()?;
        let control_addr = runtime_dir.join("control.sock");
        let control_listener =
            control::bind(&control_addr).context("failed to bind control socket")?;
        tracing::info!(
            addr = %public_addr,
            workers = config.workers,
            debug = config.debug,
            "Listening"
        );

        let files = Arc::new(FileSet::new());
        let spawner: Arc<dyn WorkerSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(ProcessSpawner::new(
                config.worker_command.clone(),
                runtime_dir.clone(),
            )),
        };

        let settings = PoolSettings {
            workers: config.workers,
            max_requests: config.max_requests,
            concurrent_requests: config.concurrent_requests,
            debug: config.debug,
            logging: config.logging,
            bootstrap_ref: config.bootstrap_ref.clone(),
            bridge_ref: config.bridge_ref.clone(),
            app_env: config.app_env.clone(),
            runtime_dir: runtime_dir.clone(),
            control_addr,
            bootstrap_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(2),
        };
        let (pool, mut pool_task) = spawn_pool(settings, spawner);

        let accepting = CancellationToken::new();
        let control_task = tokio::spawn(control::serve(
            control_listener,
            pool.clone(),
            Arc::clone(&files),
            accepting.clone(),
        ));
        let dispatch_task = tokio::spawn(dispatcher::serve(public, pool.clone(), accepting.clone()));
        let watch_task = config.debug.then(|| {
            tokio::spawn(watcher::watch_loop(
                Arc::clone(&files),
                pool.clone(),
                accepting.clone(),
            ))
        });

        let fault = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown requested");
                None
            }
            result = &mut pool_task => {
                Some(anyhow::anyhow!("pool task exited unexpectedly: {result:?}"))
            }
        };

        // Teardown: stop accepting, then drain the pool.
        accepting.cancel();
        pool.shutdown().await;

        let _ = control_task.await;
        let _ = dispatch_task.await;
        if let Some(task) = watch_task {
            let _ = task.await;
        }
        if fault.is_none() {
            let _ = pool_task.await;
        }
        if let Err(e) = std::fs::remove_dir_all(&runtime_dir) {
            tracing::debug!(error = %e, "Failed to remove runtime directory");
        }

        match fault {
            Some(fault) => Err(fault),
            None => {
                tracing::info!("Shutdown complete");
                Ok(())
            }
        }
    }
}

/// Private per-run directory holding the control socket, data sockets and
/// launch specs. The random suffix keeps concurrent pools apart; 0700 keeps
/// other users out of the unauthenticated control plane.
fn runtime_dir() -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("prefork-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime dir {}", dir.display()))?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
        .context("failed to restrict runtime dir permissions")?;
    Ok(dir)
}

/// Resolve on SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when
/// the tokio runtime is misconfigured; failing fast at startup is correct.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
