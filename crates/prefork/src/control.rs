//! Control-plane server.
//!
//! Listens on a private Unix socket inside the per-run runtime directory.
//! Every freshly forked worker dials in and must open with `register`;
//! until then the connection is unauthorized and any other frame is a
//! protocol violation. The socket is trusted (0700 runtime dir), so no
//! authentication happens here.
//!
//! Each accepted connection is tied to at most one slot. The pool closes a
//! connection by cancelling its token; the worker closes it by exiting.
//! Both paths converge on a single `ControlClosed` notification.

use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{MasterMessage, WorkerMessage};
use crate::pool::{ControlChannel, PoolHandle};
use crate::watcher::FileSet;

/// Bind the control socket, replacing any stale file from a dead run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Accept control connections until shutdown is requested.
pub async fn serve(
    listener: UnixListener,
    pool: PoolHandle,
    files: Arc<FileSet>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let pool = pool.clone();
                    let files = Arc::clone(&files);
                    tokio::spawn(handle_connection(stream, pool, files));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Control accept failed");
                }
            }
        }
    }
    tracing::debug!("Control-plane server exiting");
}

/// Drive one control connection: register handshake, then verb demux.
pub(crate) async fn handle_connection<S>(stream: S, pool: PoolHandle, files: Arc<FileSet>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = FramedRead::new(rd, JsonCodec::<WorkerMessage>::new());
    let mut writer = FramedWrite::new(wr, JsonCodec::<MasterMessage>::new());

    // Unauthorized until a valid register arrives.
    let (slot, generation, closer) = match reader.next().await {
        Some(Ok(WorkerMessage::Register {
            slot,
            generation,
            pid,
        })) => {
            let closer = CancellationToken::new();
            let channel = ControlChannel::new(closer.clone());
            match pool.register(slot, generation, pid, channel).await {
                Ok(()) => (slot, generation, closer),
                Err(e) => {
                    tracing::warn!(slot, generation, pid, error = %e, "Rejected register");
                    return;
                }
            }
        }
        Some(Ok(other)) => {
            tracing::warn!(?other, "Protocol violation: first frame was not register");
            return;
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Protocol violation: undecodable first frame");
            return;
        }
        None => return,
    };

    if let Err(e) = writer.send(MasterMessage::Bootstrap).await {
        tracing::warn!(slot, error = %e, "Failed to send bootstrap");
        pool.control_closed(slot, generation).await;
        return;
    }

    loop {
        tokio::select! {
            _ = closer.cancelled() => {
                tracing::debug!(slot, generation, "Closing control connection");
                break;
            }
            frame = reader.next() => match frame {
                Some(Ok(WorkerMessage::Ready)) => {
                    pool.ready(slot, generation).await;
                }
                Some(Ok(WorkerMessage::Files { files: paths })) => {
                    files.merge(paths);
                }
                Some(Ok(WorkerMessage::Log { message })) => {
                    tracing::info!(target: "prefork::worker", slot, "{}", message);
                }
                Some(Ok(WorkerMessage::Status)) => {
                    let Some(status) = pool.status().await else { break };
                    let reply = MasterMessage::StatusReply {
                        slots_total: status.slots_total,
                        slots_ready: status.slots_ready,
                        uptime_secs: status.uptime_secs,
                        started_at: status.started_at,
                    };
                    if writer.send(reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WorkerMessage::Register { .. })) => {
                    tracing::warn!(slot, "Protocol violation: duplicate register, recycling");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(slot, error = %e, "Protocol violation: undecodable frame, recycling");
                    break;
                }
                None => {
                    tracing::debug!(slot, generation, "Worker closed control connection");
                    break;
                }
            }
        }
    }

    pool.control_closed(slot, generation).await;
}
