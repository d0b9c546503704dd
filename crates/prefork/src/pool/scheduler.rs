//! Slot selection and the waiter queue.
//!
//! `pick` is a pure function over the slot table: least `in_flight` among
//! eligible slots, ties broken by lowest slot id so the choice is
//! deterministic. Waiters are served strictly FIFO; a waiter whose receiver
//! has been dropped is discarded when the pool tries to deliver.

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::sync::oneshot;

use super::slot::WorkerSlot;

/// A granted slot, delivered to a dispatcher connection.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub slot_id: usize,
    pub generation: u64,
    pub data_addr: PathBuf,
}

pub(crate) struct Waiter {
    pub reply: oneshot::Sender<Assignment>,
}

/// FIFO queue of connections waiting for an eligible slot.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    waiters: VecDeque<Waiter>,
}

impl WaiterQueue {
    pub fn push(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    pub fn pop(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn clear(&mut self) {
        self.waiters.clear();
    }
}

/// Pick the next slot for a connection: minimum `in_flight` among eligible
/// slots, lowest slot id on ties. Returns `None` when nothing is eligible.
pub fn pick(slots: &[WorkerSlot], concurrent_requests: bool) -> Option<usize> {
    slots
        .iter()
        .filter(|s| s.is_eligible(concurrent_requests))
        .min_by_key(|s| (s.in_flight, s.slot_id))
        .map(|s| s.slot_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::slot::SlotState;

    fn ready_slot(slot_id: usize, in_flight: usize) -> WorkerSlot {
        let mut s = WorkerSlot::new(slot_id, PathBuf::from(format!("/tmp/slot-{slot_id}.sock")));
        s.state = SlotState::Ready;
        s.in_flight = in_flight;
        s
    }

    #[test]
    fn pick_returns_none_when_no_slot_is_eligible() {
        let mut s = ready_slot(0, 0);
        s.state = SlotState::Bootstrapping;
        assert_eq!(pick(&[s], false), None);
        assert_eq!(pick(&[], false), None);
    }

    #[test]
    fn pick_prefers_least_loaded_slot() {
        let slots = vec![ready_slot(0, 2), ready_slot(1, 1), ready_slot(2, 3)];
        assert_eq!(pick(&slots, true), Some(1));
    }

    #[test]
    fn pick_breaks_ties_by_lowest_slot_id() {
        let slots = vec![ready_slot(2, 0), ready_slot(0, 0), ready_slot(1, 0)];
        assert_eq!(pick(&slots, false), Some(0));
    }

    #[test]
    fn exclusive_mode_skips_loaded_slots() {
        let slots = vec![ready_slot(0, 1), ready_slot(1, 0)];
        assert_eq!(pick(&slots, false), Some(1));
    }

    #[test]
    fn waiters_are_fifo() {
        let mut queue = WaiterQueue::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        queue.push(Waiter { reply: tx1 });
        queue.push(Waiter { reply: tx2 });

        let first = queue.pop().unwrap();
        first
            .reply
            .send(Assignment {
                slot_id: 0,
                generation: 1,
                data_addr: PathBuf::from("/tmp/slot-0.sock"),
            })
            .unwrap();

        assert_eq!(rx1.try_recv().unwrap().slot_id, 0);
        assert!(rx2.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }
}
