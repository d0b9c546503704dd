//! Operator-visible configuration.

/// Pool configuration.
///
/// `debug` enables the file watcher and emergency-mode semantics;
/// `max_requests == 0` disables recycling.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pool size: number of worker processes kept alive.
    pub workers: usize,
    /// Public listener host.
    pub host: String,
    /// Public listener port.
    pub port: u16,
    /// Requests a worker serves before being recycled. 0 disables recycling.
    pub max_requests: u64,
    /// Allow more than one proxied connection per worker at a time.
    pub concurrent_requests: bool,
    /// Debug mode: watch worker-reported files, hold the pool closed on
    /// bootstrap failure until a watched file changes.
    pub debug: bool,
    /// Request logging in workers.
    pub logging: bool,
    /// Application bootstrap identifier, passed through to workers.
    pub bootstrap_ref: String,
    /// Bridge identifier, passed through to workers.
    pub bridge_ref: String,
    /// Environment tag, passed through to workers.
    pub app_env: String,
    /// Worker command; the launch-spec path is appended as the last
    /// argument.
    pub worker_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 8,
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_requests: 1000,
            concurrent_requests: false,
            debug: false,
            logging: true,
            bootstrap_ref: "app".to_string(),
            bridge_ref: "direct".to_string(),
            app_env: "dev".to_string(),
            worker_command: Vec::new(),
        }
    }
}

impl Config {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_concurrent_requests(mut self, concurrent: bool) -> Self {
        self.concurrent_requests = concurrent;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = command;
        self
    }
}
