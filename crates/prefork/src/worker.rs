//! Worker-side runtime - runs inside the child process.
//!
//! This module provides the child side of the worker contract. The parent
//! side (spawning, slot bookkeeping) is in `pool` and `supervisor`.
//!
//! Flow: read the launch spec, bind the data socket, connect the control
//! socket, send `register`, await `bootstrap`, run the application
//! bootstrap, send `files` + `ready`, then accept proxied connections until
//! the control connection closes. A bootstrap failure exits the process,
//! which the master observes as a control close during `Bootstrapping`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{LaunchSpec, MasterMessage, WorkerMessage};

/// Application bootstrap errors.
///
/// These occur between `register` and `ready`; the process exits and the
/// master decides whether to respawn or hold the pool (debug mode).
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The application could not be loaded at all.
    #[error("failed to load application: {message}")]
    Load { message: String },

    /// The application's bootstrap raised an error.
    #[error("bootstrap failed: {message}")]
    Bootstrap { message: String },
}

impl BootstrapError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: message.into(),
        }
    }
}

/// Handle for sending control verbs from application code.
///
/// Messages are queued and written by a dedicated task, so handlers can log
/// without holding the control writer.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl ControlSender {
    /// Forward a log line to the master's operator output.
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.send(WorkerMessage::Log {
            message: message.into(),
        });
    }

    /// Ask the master for a pool status report; the reply is logged when it
    /// arrives.
    pub fn request_status(&self) {
        let _ = self.tx.send(WorkerMessage::Status);
    }

    fn send(&self, message: WorkerMessage) -> io::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "control channel closed"))
    }
}

/// Trait for the hosted application - abstracts the bridge integration.
#[async_trait]
pub trait AppBridge: Send + Sync + 'static {
    /// One-time application initialization, run between `register` and
    /// `ready`.
    async fn bootstrap(
        &self,
        spec: &LaunchSpec,
        control: &ControlSender,
    ) -> Result<(), BootstrapError>;

    /// Handle one proxied connection until either side closes.
    async fn serve(&self, stream: UnixStream, control: ControlSender) -> io::Result<()>;

    /// Source files the master should watch for this application.
    fn tracked_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Run the worker: handshake, bootstrap, then serve proxied connections.
///
/// Returns once the control connection closes (recycle or master exit),
/// after in-flight connections have drained. Errors exit the process
/// nonzero via the caller.
pub async fn run_worker<B: AppBridge>(bridge: Arc<B>, spec: LaunchSpec) -> io::Result<()> {
    if spec.data_addr.exists() {
        std::fs::remove_file(&spec.data_addr)?;
    }
    let listener = UnixListener::bind(&spec.data_addr)?;

    let control = UnixStream::connect(&spec.control_addr).await?;
    let (rd, wr) = control.into_split();
    let mut reader = FramedRead::new(rd, JsonCodec::<MasterMessage>::new());
    let mut writer = FramedWrite::new(wr, JsonCodec::<WorkerMessage>::new());

    writer
        .send(WorkerMessage::Register {
            slot: spec.slot,
            generation: spec.generation,
            pid: std::process::id(),
        })
        .await?;

    match reader.next().await {
        Some(Ok(MasterMessage::Bootstrap)) => {}
        Some(Ok(other)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected bootstrap, got {other:?}"),
            ));
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed before bootstrap",
            ));
        }
    }

    // All further writes go through one queue so handler logs and lifecycle
    // verbs never interleave mid-frame.
    let (tx, mut outbound) = mpsc::unbounded_channel::<WorkerMessage>();
    let control = ControlSender { tx };
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if writer.send(message).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = bridge.bootstrap(&spec, &control).await {
        tracing::error!(slot = spec.slot, error = %e, "Bootstrap failed");
        return Err(io::Error::other(e.to_string()));
    }

    let files = bridge.tracked_files();
    if !files.is_empty() {
        control.send(WorkerMessage::Files { files })?;
    }
    control.send(WorkerMessage::Ready)?;
    tracing::debug!(slot = spec.slot, generation = spec.generation, "Worker ready");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let bridge = Arc::clone(&bridge);
                    let control = control.clone();
                    connections.spawn(async move {
                        if let Err(e) = bridge.serve(stream, control).await {
                            tracing::debug!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Data socket accept failed");
                }
            },
            message = reader.next() => match message {
                Some(Ok(MasterMessage::StatusReply { slots_total, slots_ready, uptime_secs, started_at })) => {
                    tracing::info!(slots_total, slots_ready, uptime_secs, started_at = %started_at, "Pool status");
                }
                Some(Ok(MasterMessage::Bootstrap)) => {
                    tracing::warn!("Unexpected bootstrap after ready");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Control channel error, exiting");
                    break;
                }
                None => {
                    tracing::debug!(slot = spec.slot, "Control connection closed, exiting");
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Stop accepting, let in-flight connections finish.
    drop(listener);
    while connections.join_next().await.is_some() {}
    writer_task.abort();
    let _ = std::fs::remove_file(&spec.data_addr);
    Ok(())
}
