//! Exclusive access to a device's transport channel
//!
//! One transport call may be in flight per session. Extraction calls queue
//! in [`TransportGate::acquire`]; heartbeat probes and reconnect attempts use
//! [`TransportGate::acquire_priority`] and overtake every queued extraction
//! call.

use crate::core::cancel::CancelToken;
use crate::core::error::{ExtractionError, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How often queued callers re-check their cancel token
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct GateState {
    busy: bool,
    priority_waiting: usize,
}

#[derive(Debug, Default)]
pub struct TransportGate {
    state: Mutex<GateState>,
    released: Condvar,
}

/// Held while a transport call is in flight; releases the gate on drop
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a TransportGate,
}

impl TransportGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the channel; gives up with `Cancelled` once `cancel` fires
    pub fn acquire(&self, cancel: &CancelToken) -> Result<GatePermit<'_>> {
        let mut state = self.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }
            if !state.busy && state.priority_waiting == 0 {
                state.busy = true;
                return Ok(GatePermit { gate: self });
            }
            state = self
                .released
                .wait_timeout(state, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait for the channel ahead of all regular callers
    pub fn acquire_priority(&self) -> GatePermit<'_> {
        let mut state = self.lock();
        state.priority_waiting += 1;
        while state.busy {
            state = self
                .released
                .wait_timeout(state, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.priority_waiting -= 1;
        state.busy = true;
        GatePermit { gate: self }
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    fn release(&self) {
        self.lock().busy = false;
        self.released.notify_all();
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_permit_releases_on_drop() {
        let gate = TransportGate::new();
        let cancel = CancelToken::new();
        {
            let _permit = gate.acquire(&cancel).unwrap();
            assert!(gate.is_busy());
        }
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_holders_never_overlap() {
        let gate = Arc::new(TransportGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    let cancel = CancelToken::new();
                    for _ in 0..10 {
                        let _permit = gate.acquire(&cancel).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_releases_waiter() {
        let gate = Arc::new(TransportGate::new());
        let cancel = CancelToken::new();
        let _held = gate.acquire(&CancelToken::new()).unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = gate.acquire(&cancel).map(|_| ());
                (result, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        let (result, waited) = waiter.join().unwrap();
        assert_eq!(result, Err(ExtractionError::Cancelled));
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn test_priority_overtakes_queued_callers() {
        let gate = Arc::new(TransportGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = gate.acquire(&CancelToken::new()).unwrap();

        let regular = {
            let gate = gate.clone();
            let order = order.clone();
            thread::spawn(move || {
                let _permit = gate.acquire(&CancelToken::new()).unwrap();
                order.lock().unwrap().push("regular");
            })
        };
        thread::sleep(Duration::from_millis(20));
        let priority = {
            let gate = gate.clone();
            let order = order.clone();
            thread::spawn(move || {
                let _permit = gate.acquire_priority();
                order.lock().unwrap().push("priority");
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        regular.join().unwrap();
        priority.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["priority", "regular"]);
    }
}
