//! Test doubles shared across module tests.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use crate::bridge::protocol::LaunchSpec;
use crate::pool::PoolEvent;
use crate::supervisor::{SpawnError, WorkerProc, WorkerSpawner};

/// Spawner that records launch specs and hands back detached proc handles,
/// so pool transitions can be driven without real child processes.
pub(crate) struct FakeSpawner {
    specs: StdMutex<Vec<LaunchSpec>>,
    events: StdMutex<Option<mpsc::Sender<PoolEvent>>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            specs: StdMutex::new(Vec::new()),
            events: StdMutex::new(None),
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    /// Deliver the exit event a real child's watch task would send.
    pub async fn report_exit(&self, slot: usize, generation: u64) {
        let tx = self.events.lock().unwrap().clone().unwrap();
        let _ = tx.send(PoolEvent::ChildExited { slot, generation }).await;
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(
        &self,
        spec: &LaunchSpec,
        events: mpsc::Sender<PoolEvent>,
    ) -> Result<WorkerProc, SpawnError> {
        self.specs.lock().unwrap().push(spec.clone());
        *self.events.lock().unwrap() = Some(events);
        Ok(WorkerProc::detached())
    }
}
