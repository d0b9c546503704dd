//! Public front-end: accept, buffer, pick a worker, splice.
//!
//! The dispatcher is byte-transparent and protocol-agnostic: it never parses
//! the proxied stream, opens exactly one backend connection per client, and
//! never retries. While a connection waits for a slot its bytes accumulate
//! in memory, so slow scheduling never blocks the client's first write.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, UnixStream};
use tokio_util::bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use crate::pool::PoolHandle;

/// Stages slower than this emit a diagnostic warning.
const SLOW_STAGE: Duration = Duration::from_secs(1);

/// Accept client connections until shutdown is requested.
pub async fn serve(listener: TcpListener, pool: PoolHandle, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "Client connected");
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        handle_client(stream, &pool).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Public accept failed");
                }
            }
        }
    }
    tracing::debug!("Dispatcher exiting");
}

/// Proxy one client connection through a pool worker.
pub(crate) async fn handle_client<S>(mut client: S, pool: &PoolHandle)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wait_started = Instant::now();
    let Some(mut pending) = pool.request_slot().await else {
        return;
    };

    // Buffer the client while the scheduler looks for a slot. A client that
    // hangs up here just drops the waiter; no slot state is touched.
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let assignment = loop {
        tokio::select! {
            granted = &mut pending => match granted {
                Ok(assignment) => break assignment,
                Err(_) => return, // pool is shutting down
            },
            read = client.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    tracing::trace!("Client closed before a worker was assigned");
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Client read failed before assignment");
                    return;
                }
            }
        }
    };
    let slot = assignment.slot_id;
    warn_if_slow("scheduler_wait", slot, wait_started.elapsed());

    let dial_started = Instant::now();
    let mut backend = match UnixStream::connect(&assignment.data_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(slot, error = %e, "Failed to dial worker, dropping client");
            pool.release(slot, assignment.generation, false).await;
            return;
        }
    };
    warn_if_slow("backend_dial", slot, dial_started.elapsed());

    let splice_started = Instant::now();
    let spliced = async {
        if !buffer.is_empty() {
            backend.write_all(&buffer).await?;
        }
        copy_bidirectional(&mut client, &mut backend).await
    }
    .await;

    match spliced {
        Ok((to_worker, to_client)) => {
            tracing::trace!(slot, to_worker, to_client, "Proxy finished");
        }
        Err(e) => {
            tracing::debug!(slot, error = %e, "Proxy ended with error");
        }
    }
    warn_if_slow("splice", slot, splice_started.elapsed());

    pool.release(slot, assignment.generation, true).await;
}

fn warn_if_slow(stage: &'static str, slot: usize, elapsed: Duration) {
    if elapsed > SLOW_STAGE {
        tracing::warn!(
            stage,
            slot,
            latency_ms = elapsed.as_millis() as u64,
            "Slow proxy stage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolSettings, SlotState, spawn_pool};
    use crate::testutil::FakeSpawner;
    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken as TestToken;

    fn settings(runtime_dir: std::path::PathBuf) -> PoolSettings {
        PoolSettings {
            workers: 1,
            max_requests: 0,
            concurrent_requests: false,
            debug: false,
            logging: false,
            bootstrap_ref: "app".to_string(),
            bridge_ref: "bridge".to_string(),
            app_env: "test".to_string(),
            control_addr: runtime_dir.join("control.sock"),
            runtime_dir,
            bootstrap_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(50),
        }
    }

    async fn boot_slot(pool: &crate::pool::PoolHandle) -> u64 {
        let generation = pool.snapshot().await.unwrap().slots[0].generation;
        let token = TestToken::new();
        pool.register(0, generation, 1, crate::pool::ControlChannel::new(token))
            .await
            .unwrap();
        pool.ready(0, generation).await;
        generation
    }

    /// Echo everything a single backend connection sends.
    fn spawn_echo_backend(listener: UnixListener) {
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            }
        });
    }

    #[tokio::test]
    async fn bytes_sent_before_assignment_reach_the_worker_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = FakeSpawner::new();
        let (pool, _join) = spawn_pool(settings(dir.path().to_path_buf()), spawner);

        let data_addr = pool.snapshot().await.unwrap().slots[0].data_addr.clone();
        spawn_echo_backend(UnixListener::bind(&data_addr).unwrap());

        let (client_side, dispatcher_side) = tokio::io::duplex(4096);
        let pool_for_conn = pool.clone();
        let conn = tokio::spawn(async move {
            handle_client(dispatcher_side, &pool_for_conn).await;
        });

        // Client writes while no worker is ready yet; bytes must buffer.
        let (mut rd, mut wr) = tokio::io::split(client_side);
        wr.write_all(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        boot_slot(&pool).await;

        let mut reply = [0u8; 5];
        rd.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");

        // Client hangs up; the slot is released and counted.
        drop(wr);
        conn.await.unwrap();

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.slots[0].state, SlotState::Ready);
        assert_eq!(snapshot.slots[0].in_flight, 0);
        assert_eq!(snapshot.slots[0].served, 1);
    }

    #[tokio::test]
    async fn backend_dial_failure_releases_the_slot_without_counting() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = FakeSpawner::new();
        let (pool, _join) = spawn_pool(settings(dir.path().to_path_buf()), spawner);

        // Slot is ready but nothing listens on its data socket.
        boot_slot(&pool).await;

        let (client_side, dispatcher_side) = tokio::io::duplex(4096);
        handle_client(dispatcher_side, &pool).await;
        drop(client_side);

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.slots[0].state, SlotState::Ready);
        assert_eq!(snapshot.slots[0].in_flight, 0);
        assert_eq!(snapshot.slots[0].served, 0);
    }

    #[tokio::test]
    async fn client_disconnect_during_wait_touches_no_slot() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = FakeSpawner::new();
        let (pool, _join) = spawn_pool(settings(dir.path().to_path_buf()), spawner);

        let (client_side, dispatcher_side) = tokio::io::duplex(4096);
        let pool_for_conn = pool.clone();
        let conn = tokio::spawn(async move {
            handle_client(dispatcher_side, &pool_for_conn).await;
        });

        // No worker is ready; the client gives up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(client_side);
        conn.await.unwrap();

        boot_slot(&pool).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.slots[0].state, SlotState::Ready);
        assert_eq!(snapshot.slots[0].in_flight, 0);
        assert_eq!(snapshot.waiting, 0);
    }

    #[tokio::test]
    async fn second_connection_waits_until_the_first_completes() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = FakeSpawner::new();
        let (pool, _join) = spawn_pool(settings(dir.path().to_path_buf()), spawner);

        let data_addr = pool.snapshot().await.unwrap().slots[0].data_addr.clone();
        boot_slot(&pool).await;

        let listener = UnixListener::bind(&data_addr).unwrap();
        tokio::spawn(async move {
            // Echo one connection at a time, like an exclusive-mode worker.
            while let Ok((mut stream, _)) = listener.accept().await {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            }
        });

        let (c1, d1) = tokio::io::duplex(4096);
        let (c2, d2) = tokio::io::duplex(4096);
        let p1 = pool.clone();
        let p2 = pool.clone();
        let conn1 = tokio::spawn(async move { handle_client(d1, &p1).await });
        // Let the first connection claim the slot before the second queues.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn2 = tokio::spawn(async move { handle_client(d2, &p2).await });

        let (mut rd1, mut wr1) = tokio::io::split(c1);
        let (mut rd2, mut wr2) = tokio::io::split(c2);

        wr1.write_all(b"first").await.unwrap();
        wr2.write_all(b"second").await.unwrap();

        let mut reply = [0u8; 5];
        rd1.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"first");

        // C2 sees nothing while C1 holds the only worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(50), rd2.read(&mut probe)).await;
        assert!(pending.is_err(), "second client should still be waiting");
        assert_eq!(pool.snapshot().await.unwrap().waiting, 1);

        // C1 finishes; C2 gets the slot and its echo.
        drop(wr1);
        conn1.await.unwrap();

        let mut reply = [0u8; 6];
        rd2.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"second");

        drop(wr2);
        conn2.await.unwrap();

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.slots[0].served, 2);
    }
}
