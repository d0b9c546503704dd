use clap::Parser;
use tracing_subscriber::EnvFilter;

use prefork::{Config, Lifecycle};

/// Prefork worker-pool supervisor and TCP request router.
#[derive(Parser)]
#[command(name = "prefork", version, about)]
struct Args {
    /// Number of worker processes to keep alive.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Public listener host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Public listener port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Requests a worker serves before being recycled (0 disables).
    #[arg(long, default_value_t = 1000)]
    max_requests: u64,

    /// Allow concurrent proxied connections per worker.
    #[arg(long)]
    concurrent_requests: bool,

    /// Debug mode: watch worker-reported files and hold the pool closed on
    /// bootstrap failure until a watched file changes.
    #[arg(long)]
    debug: bool,

    /// Disable request logging in workers.
    #[arg(long)]
    quiet: bool,

    /// Application bootstrap identifier, passed through to workers.
    #[arg(long, default_value = "app")]
    bootstrap: String,

    /// Bridge identifier, passed through to workers.
    #[arg(long, default_value = "direct")]
    bridge: String,

    /// Environment tag, passed through to workers.
    #[arg(long, default_value = "dev")]
    app_env: String,

    /// Worker command; the launch-spec path is appended as the last
    /// argument, e.g. `prefork -- my-worker --flag`.
    #[arg(last = true, required = true)]
    worker_command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.debug {
            "prefork=debug"
        } else {
            "prefork=info"
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config {
        workers: args.workers,
        host: args.host,
        port: args.port,
        max_requests: args.max_requests,
        concurrent_requests: args.concurrent_requests,
        debug: args.debug,
        logging: !args.quiet,
        bootstrap_ref: args.bootstrap,
        bridge_ref: args.bridge,
        app_env: args.app_env,
        worker_command: args.worker_command,
    };

    Lifecycle::new(config).run().await
}
