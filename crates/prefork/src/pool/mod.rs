//! Single-owner slot table: supervision bookkeeping and scheduling.
//!
//! One task owns every `WorkerSlot`. The control plane, dispatcher, file
//! watcher and lifecycle controller all talk to it through `PoolHandle`;
//! each mutation is a `PoolEvent` handled serially, so slot state and
//! `in_flight` counts never race.
//!
//! Flow per slot: spawn → `register` → bootstrap → `ready` → (assignments…)
//! → control close → respawn. Control-channel close is the authoritative
//! "worker is gone" signal regardless of which side initiated it.

pub mod scheduler;
pub mod slot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::LaunchSpec;
use crate::supervisor::WorkerSpawner;

pub use scheduler::Assignment;
pub use slot::{ControlChannel, SlotState, WorkerSlot};

use scheduler::{Waiter, WaiterQueue, pick};

/// Settings the pool task needs; derived from the operator config plus the
/// per-run runtime directory.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    /// Requests a worker serves before being recycled. 0 disables recycling.
    pub max_requests: u64,
    pub concurrent_requests: bool,
    pub debug: bool,
    pub logging: bool,
    pub bootstrap_ref: String,
    pub bridge_ref: String,
    pub app_env: String,
    pub runtime_dir: PathBuf,
    pub control_addr: PathBuf,
    /// How long a worker may sit in `Bootstrapping` before it is treated
    /// as a bootstrap failure.
    pub bootstrap_timeout: Duration,
    /// How long to wait after SIGTERM before SIGKILL on shutdown.
    pub shutdown_grace: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("no slot {0} in this pool")]
    UnknownSlot(usize),
    #[error("slot {slot} is {state:?}, not awaiting register")]
    UnexpectedState { slot: usize, state: SlotState },
    #[error("slot {slot} is at generation {expected}, register claims {got}")]
    StaleGeneration { slot: usize, expected: u64, got: u64 },
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("pool is gone")]
    PoolClosed,
}

/// Placeholder status report (request/response shape is the contract).
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub slots_total: usize,
    pub slots_ready: usize,
    pub uptime_secs: u64,
    /// Master start time, RFC 3339.
    pub started_at: String,
}

/// Read-only view of one slot, for status and tests.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub slot_id: usize,
    pub state: SlotState,
    pub generation: u64,
    pub in_flight: usize,
    pub served: u64,
    pub close_when_free: bool,
    pub bootstrap_failures: u32,
    pub data_addr: PathBuf,
}

/// Read-only view of the pool.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub slots: Vec<SlotSnapshot>,
    pub emergency: bool,
    pub in_shutdown: bool,
    pub waiting: usize,
}

/// Everything that can happen to the slot table.
#[derive(Debug)]
pub enum PoolEvent {
    /// First frame of a control connection was a valid `register`.
    Register {
        slot: usize,
        generation: u64,
        pid: u32,
        channel: ControlChannel,
        reply: oneshot::Sender<Result<(), RegisterError>>,
    },
    /// Worker finished its application bootstrap.
    Ready { slot: usize, generation: u64 },
    /// Control connection is gone (either side closed it).
    ControlClosed { slot: usize, generation: u64 },
    /// Child process exited and was reaped.
    ChildExited { slot: usize, generation: u64 },
    /// A dispatcher connection wants a slot.
    Acquire { reply: oneshot::Sender<Assignment> },
    /// A proxied connection ended. `completed` is false for backend dial
    /// failures, which release the slot without counting a request.
    Release {
        slot: usize,
        generation: u64,
        completed: bool,
    },
    /// Watched file changed: rolling restart.
    Reload,
    /// Worker asked for a status report.
    Status { reply: oneshot::Sender<StatusInfo> },
    /// Begin (or join) shutdown; reply fires once every child is gone.
    Shutdown { reply: oneshot::Sender<()> },
    Snapshot { reply: oneshot::Sender<PoolSnapshot> },
    /// Internal: back-off timer for a slot expired.
    Respawn { slot: usize },
    /// Internal: a worker has been bootstrapping for too long.
    BootstrapTimeout { slot: usize, generation: u64 },
    /// Internal: shutdown grace expired, SIGKILL stragglers.
    ForceKillRemaining,
}

/// Cloneable handle for talking to the pool task.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolEvent>,
}

impl PoolHandle {
    pub async fn register(
        &self,
        slot: usize,
        generation: u64,
        pid: u32,
        channel: ControlChannel,
    ) -> Result<(), RegisterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolEvent::Register {
                slot,
                generation,
                pid,
                channel,
                reply,
            })
            .await
            .map_err(|_| RegisterError::PoolClosed)?;
        rx.await.map_err(|_| RegisterError::PoolClosed)?
    }

    pub async fn ready(&self, slot: usize, generation: u64) {
        let _ = self.tx.send(PoolEvent::Ready { slot, generation }).await;
    }

    pub async fn control_closed(&self, slot: usize, generation: u64) {
        let _ = self
            .tx
            .send(PoolEvent::ControlClosed { slot, generation })
            .await;
    }

    /// Queue for the next eligible slot. The returned receiver resolves with
    /// the assignment; dropping it cancels the wait without touching any
    /// slot state.
    pub async fn request_slot(&self) -> Option<oneshot::Receiver<Assignment>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolEvent::Acquire { reply }).await.ok()?;
        Some(rx)
    }

    pub async fn release(&self, slot: usize, generation: u64, completed: bool) {
        let _ = self
            .tx
            .send(PoolEvent::Release {
                slot,
                generation,
                completed,
            })
            .await;
    }

    pub async fn reload(&self) {
        let _ = self.tx.send(PoolEvent::Reload).await;
    }

    pub async fn status(&self) -> Option<StatusInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolEvent::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Initiate shutdown and wait until every child process is gone.
    /// Idempotent: concurrent callers all resolve when teardown completes.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolEvent::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> Option<PoolSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolEvent::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Start the pool task: builds the slot table, spawns the initial fill, and
/// runs the event loop until shutdown completes.
pub fn spawn_pool(
    settings: PoolSettings,
    spawner: Arc<dyn WorkerSpawner>,
) -> (PoolHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let pool = Pool::new(settings, spawner, tx.clone());
    let join = tokio::spawn(pool.run(rx));
    (PoolHandle { tx }, join)
}

struct Pool {
    settings: PoolSettings,
    spawner: Arc<dyn WorkerSpawner>,
    slots: Vec<WorkerSlot>,
    waiters: WaiterQueue,
    events_tx: mpsc::Sender<PoolEvent>,
    emergency: bool,
    in_reload: bool,
    in_shutdown: bool,
    wait_for_initial_fill: bool,
    started_at: Instant,
    started_wall: chrono::DateTime<chrono::Utc>,
    shutdown_acks: Vec<oneshot::Sender<()>>,
}

impl Pool {
    fn new(
        settings: PoolSettings,
        spawner: Arc<dyn WorkerSpawner>,
        events_tx: mpsc::Sender<PoolEvent>,
    ) -> Self {
        let slots = (0..settings.workers)
            .map(|i| {
                let data_addr = settings.runtime_dir.join(format!("slot-{i}.sock"));
                WorkerSlot::new(i, data_addr)
            })
            .collect();

        Self {
            settings,
            spawner,
            slots,
            waiters: WaiterQueue::default(),
            events_tx,
            emergency: false,
            in_reload: false,
            in_shutdown: false,
            wait_for_initial_fill: true,
            started_at: Instant::now(),
            started_wall: chrono::Utc::now(),
            shutdown_acks: Vec::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PoolEvent>) {
        for slot in 0..self.slots.len() {
            self.spawn_slot(slot);
        }

        while let Some(event) = rx.recv().await {
            self.handle(event);

            if self.in_shutdown && self.shutdown_acks.is_empty() && self.live_children() == 0 {
                break;
            }
        }

        tracing::debug!("Pool task exiting");
    }

    fn handle(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Register {
                slot,
                generation,
                pid,
                channel,
                reply,
            } => {
                let _ = reply.send(self.handle_register(slot, generation, pid, channel));
            }
            PoolEvent::Ready { slot, generation } => self.handle_ready(slot, generation),
            PoolEvent::ControlClosed { slot, generation } => {
                self.handle_control_closed(slot, generation)
            }
            PoolEvent::ChildExited { slot, generation } => {
                self.handle_child_exited(slot, generation)
            }
            PoolEvent::Acquire { reply } => self.handle_acquire(reply),
            PoolEvent::Release {
                slot,
                generation,
                completed,
            } => self.handle_release(slot, generation, completed),
            PoolEvent::Reload => self.handle_reload(),
            PoolEvent::Status { reply } => {
                let _ = reply.send(self.status_info());
            }
            PoolEvent::Shutdown { reply } => self.handle_shutdown(reply),
            PoolEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolEvent::Respawn { slot } => self.handle_respawn(slot),
            PoolEvent::BootstrapTimeout { slot, generation } => {
                self.handle_bootstrap_timeout(slot, generation)
            }
            PoolEvent::ForceKillRemaining => self.handle_force_kill(),
        }
    }

    fn handle_register(
        &mut self,
        slot: usize,
        generation: u64,
        pid: u32,
        channel: ControlChannel,
    ) -> Result<(), RegisterError> {
        if self.in_shutdown {
            return Err(RegisterError::ShuttingDown);
        }
        let s = self
            .slots
            .get_mut(slot)
            .ok_or(RegisterError::UnknownSlot(slot))?;
        if s.generation != generation {
            return Err(RegisterError::StaleGeneration {
                slot,
                expected: s.generation,
                got: generation,
            });
        }
        if s.state != SlotState::AwaitingRegister {
            return Err(RegisterError::UnexpectedState {
                slot,
                state: s.state,
            });
        }

        s.pid = Some(pid);
        s.control = Some(channel);
        s.state = SlotState::Bootstrapping;
        tracing::debug!(slot, generation, pid, "Worker registered, bootstrapping");

        let timeout = self.settings.bootstrap_timeout;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx
                .send(PoolEvent::BootstrapTimeout { slot, generation })
                .await;
        });
        Ok(())
    }

    /// A worker that never reports ready is a bootstrap failure.
    fn handle_bootstrap_timeout(&mut self, slot: usize, generation: u64) {
        let Some(s) = self.slots.get(slot) else {
            return;
        };
        if s.generation != generation || s.state != SlotState::Bootstrapping {
            return;
        }
        tracing::warn!(slot, generation, "Bootstrap timed out, recycling worker");
        if let Some(control) = &s.control {
            control.close();
        }
    }

    fn handle_ready(&mut self, slot: usize, generation: u64) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.generation != generation {
            return;
        }
        if s.state != SlotState::Bootstrapping {
            tracing::warn!(slot, state = ?s.state, "Unexpected ready, recycling slot");
            if let Some(control) = &s.control {
                control.close();
            }
            return;
        }

        s.state = SlotState::Ready;
        s.bootstrap_failures = 0;
        s.reached_ready_once = true;
        tracing::debug!(slot, generation, "Worker ready");

        if self.wait_for_initial_fill && self.slots.iter().all(|s| s.reached_ready_once) {
            self.wait_for_initial_fill = false;
            tracing::info!(workers = self.slots.len(), "All workers are up and ready");
        }

        if self.emergency && self.slots.iter().all(|s| s.state == SlotState::Ready) {
            self.emergency = false;
            tracing::info!("Emergency mode cleared, pool back online");
        }

        self.service_waiters();
    }

    fn handle_control_closed(&mut self, slot: usize, generation: u64) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.generation != generation {
            return;
        }

        let was_bootstrapping = s.state == SlotState::Bootstrapping;
        s.control = None;
        s.pid = None;

        // Kill outright; the exit-watch task reaps, so no zombie survives.
        if let Some(proc) = &s.proc {
            proc.kill();
        }
        if s.state != SlotState::KeepClosed {
            s.state = SlotState::Dead;
        }
        tracing::debug!(slot, generation, was_bootstrapping, "Control connection closed");

        if was_bootstrapping {
            self.bootstrap_failed(slot);
            return;
        }

        if !self.in_shutdown && self.slots[slot].state != SlotState::KeepClosed {
            self.spawn_slot(slot);
        }
    }

    fn bootstrap_failed(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        s.bootstrap_failures += 1;
        let failures = s.bootstrap_failures;

        if self.in_shutdown {
            return;
        }

        if self.settings.debug {
            tracing::error!(slot, failures, "Bootstrap failed, entering emergency mode");
            self.enter_emergency();
        } else {
            let delay = respawn_delay(failures);
            tracing::warn!(slot, failures, delay_ms = delay.as_millis() as u64, "Bootstrap failed, respawning after back-off");
            self.schedule_respawn(slot, delay);
        }
    }

    /// Hold the entire pool closed until the file watcher observes a change.
    fn enter_emergency(&mut self) {
        self.emergency = true;
        tracing::error!("Pool held closed: fix the application and save a watched file to restart");

        for s in &mut self.slots {
            s.state = SlotState::KeepClosed;
            s.close_when_free = false;
            if let Some(control) = &s.control {
                control.close();
            } else if let Some(proc) = &s.proc {
                proc.kill();
            }
        }
    }

    fn handle_child_exited(&mut self, slot: usize, generation: u64) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.generation != generation {
            return;
        }

        s.proc = None;
        s.pid = None;

        if let Some(control) = &s.control {
            // Child died with the control connection still open; closing it
            // funnels everything through the one close path.
            control.close();
        } else if s.state != SlotState::KeepClosed && !self.in_shutdown {
            let premature = matches!(
                s.state,
                SlotState::Spawning | SlotState::AwaitingRegister
            );
            s.state = SlotState::Dead;
            if premature {
                tracing::warn!(slot, generation, "Worker exited before registering");
                self.schedule_respawn(slot, Duration::from_millis(500));
            } else {
                self.spawn_slot(slot);
            }
        }

        self.maybe_ack_shutdown();
    }

    fn handle_acquire(&mut self, reply: oneshot::Sender<Assignment>) {
        if self.in_shutdown {
            return; // dropping the reply closes the waiter's receiver
        }
        self.waiters.push(Waiter { reply });
        self.service_waiters();
    }

    fn handle_release(&mut self, slot: usize, generation: u64, completed: bool) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.generation != generation {
            return;
        }

        s.in_flight = s.in_flight.saturating_sub(1);
        if completed {
            s.served += 1;
        }
        if s.state == SlotState::Busy && s.in_flight == 0 {
            s.state = SlotState::Ready;
        }

        let max = self.settings.max_requests;
        if max > 0 && s.served >= max && matches!(s.state, SlotState::Ready | SlotState::Busy) {
            tracing::debug!(slot, served = s.served, "Worker reached max requests, draining");
            s.state = SlotState::Draining;
        }

        if (s.state == SlotState::Draining || s.close_when_free) && s.in_flight == 0 {
            if let Some(control) = &s.control {
                control.close();
            }
        }

        self.service_waiters();
    }

    fn handle_reload(&mut self) {
        if self.in_reload {
            return;
        }
        self.in_reload = true;

        let was_emergency = self.emergency;
        self.emergency = false;
        if was_emergency {
            // Recovery gets the full "ready" banner again.
            self.wait_for_initial_fill = true;
            for s in &mut self.slots {
                s.reached_ready_once = false;
            }
        }
        tracing::info!(was_emergency, "Restarting all workers");

        for slot in 0..self.slots.len() {
            let s = &mut self.slots[slot];
            s.bootstrap_failures = 0;
            s.close_when_free = false;
            if s.state == SlotState::KeepClosed {
                s.state = SlotState::Dead;
            }

            if s.control.is_some() {
                s.state = SlotState::Draining;
                if s.in_flight == 0 {
                    if let Some(control) = &s.control {
                        control.close();
                    }
                } else {
                    s.close_when_free = true;
                }
            } else if let Some(proc) = &s.proc {
                // Mid-boot child from before the change; its exit respawns.
                proc.kill();
            } else {
                self.spawn_slot(slot);
            }
        }

        self.in_reload = false;
    }

    fn handle_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if !self.in_shutdown {
            self.in_shutdown = true;
            tracing::info!("Shutting down pool");

            self.waiters.clear();
            for s in &mut self.slots {
                if let Some(control) = &s.control {
                    control.close();
                }
                if let Some(proc) = &s.proc {
                    proc.terminate();
                }
            }

            let grace = self.settings.shutdown_grace;
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(PoolEvent::ForceKillRemaining).await;
            });
        }

        self.shutdown_acks.push(reply);
        self.maybe_ack_shutdown();
    }

    fn handle_force_kill(&mut self) {
        for s in &mut self.slots {
            if let Some(proc) = &s.proc {
                if proc.pid().is_some() {
                    tracing::warn!(slot = s.slot_id, "Worker did not exit in time, killing");
                    proc.kill();
                } else {
                    // Detached handle (tests): no exit event will ever come.
                    s.proc = None;
                }
            }
        }
        self.maybe_ack_shutdown();
    }

    fn handle_respawn(&mut self, slot: usize) {
        let Some(s) = self.slots.get(slot) else {
            return;
        };
        if self.in_shutdown
            || s.state == SlotState::KeepClosed
            || s.proc.is_some()
            || s.control.is_some()
        {
            return;
        }
        self.spawn_slot(slot);
    }

    fn spawn_slot(&mut self, slot: usize) {
        let spec = {
            let settings = &self.settings;
            let s = &mut self.slots[slot];

            s.generation += 1;
            s.pid = None;
            s.in_flight = 0;
            s.served = 0;
            s.close_when_free = false;
            s.state = SlotState::Spawning;

            LaunchSpec {
                slot,
                generation: s.generation,
                data_addr: s.data_addr.clone(),
                control_addr: settings.control_addr.clone(),
                bootstrap_ref: settings.bootstrap_ref.clone(),
                bridge_ref: settings.bridge_ref.clone(),
                app_env: settings.app_env.clone(),
                debug: settings.debug,
                logging: settings.logging,
            }
        };

        match self.spawner.spawn(&spec, self.events_tx.clone()) {
            Ok(proc) => {
                let s = &mut self.slots[slot];
                s.proc = Some(proc);
                s.state = SlotState::AwaitingRegister;
            }
            Err(e) => {
                tracing::error!(slot, error = %e, "Failed to spawn worker");
                self.slots[slot].state = SlotState::Dead;
                self.schedule_respawn(slot, Duration::from_secs(1));
            }
        }
    }

    fn schedule_respawn(&self, slot: usize, delay: Duration) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PoolEvent::Respawn { slot }).await;
        });
    }

    /// Hand queued waiters to eligible slots, FIFO. A waiter whose receiver
    /// is gone rolls its tentative assignment back untouched.
    fn service_waiters(&mut self) {
        if self.in_shutdown {
            return;
        }
        while !self.waiters.is_empty() {
            let Some(slot) = pick(&self.slots, self.settings.concurrent_requests) else {
                break;
            };
            let Some(waiter) = self.waiters.pop() else {
                break;
            };

            let s = &mut self.slots[slot];
            s.in_flight += 1;
            if !self.settings.concurrent_requests {
                s.state = SlotState::Busy;
            }
            let assignment = Assignment {
                slot_id: slot,
                generation: s.generation,
                data_addr: s.data_addr.clone(),
            };

            if waiter.reply.send(assignment).is_err() {
                let s = &mut self.slots[slot];
                s.in_flight -= 1;
                if !self.settings.concurrent_requests && s.in_flight == 0 {
                    s.state = SlotState::Ready;
                }
            }
        }
    }

    fn live_children(&self) -> usize {
        self.slots.iter().filter(|s| s.has_live_child()).count()
    }

    fn maybe_ack_shutdown(&mut self) {
        if self.in_shutdown && self.live_children() == 0 {
            for ack in self.shutdown_acks.drain(..) {
                let _ = ack.send(());
            }
        }
    }

    fn status_info(&self) -> StatusInfo {
        StatusInfo {
            slots_total: self.slots.len(),
            slots_ready: self
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Ready)
                .count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            started_at: self.started_wall.to_rfc3339(),
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            slots: self
                .slots
                .iter()
                .map(|s| SlotSnapshot {
                    slot_id: s.slot_id,
                    state: s.state,
                    generation: s.generation,
                    in_flight: s.in_flight,
                    served: s.served,
                    close_when_free: s.close_when_free,
                    bootstrap_failures: s.bootstrap_failures,
                    data_addr: s.data_addr.clone(),
                })
                .collect(),
            emergency: self.emergency,
            in_shutdown: self.in_shutdown,
            waiting: self.waiters.len(),
        }
    }
}

/// Bounded exponential back-off for repeated bootstrap failures.
fn respawn_delay(failures: u32) -> Duration {
    let millis = (100u64 << failures.min(6)).min(5_000);
    Duration::from_millis(millis)
}
