//! One-shot and re-armable signals built on channel disconnection.
//!
//! A receiver whose senders are all gone is permanently ready, so it can be
//! polled or waited on by any number of threads and used as a `Select`
//! operand next to real channel operations.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A signal that fires once and stays fired.
///
/// Firing more than once is a no-op.
#[derive(Debug)]
pub struct Latch {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Fire the latch. Returns true if this call did the firing.
    pub fn fire(&self) -> bool {
        lock(&self.tx).take().is_some()
    }

    pub fn is_fired(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until the latch fires.
    pub fn wait(&self) {
        // nothing is ever sent, so recv only returns once disconnected
        let _ = self.rx.recv();
    }

    /// Block until the latch fires or `timeout` passes. Returns true if fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// A receiver that becomes ready when the latch fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// An open/closed switch whose open state can be waited on.
///
/// While open, [`Gate::receiver`] hands out a receiver that is always
/// ready. Closing swaps in a receiver that never becomes ready until the
/// gate is opened again.
#[derive(Debug)]
pub struct Gate {
    state: Mutex<GateState>,
}

#[derive(Debug)]
struct GateState {
    rx: Receiver<()>,
    /// Present while the gate is closed.
    tx: Option<Sender<()>>,
}

impl Gate {
    /// A gate that starts open.
    pub fn open() -> Self {
        let (tx, rx) = bounded(0);
        drop(tx);
        Self {
            state: Mutex::new(GateState { rx, tx: None }),
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).tx.is_none()
    }

    /// Open the gate, waking everyone waiting on the current receiver.
    pub fn start(&self) {
        lock(&self.state).tx = None;
    }

    /// Close the gate. Receivers handed out earlier stay as they were.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        if state.tx.is_none() {
            let (tx, rx) = bounded(0);
            state.tx = Some(tx);
            state.rx = rx;
        }
    }

    /// Receiver for the gate's current state; ready once the gate is open.
    pub fn receiver(&self) -> Receiver<()> {
        lock(&self.state).rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latch_fires_once() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        assert!(!latch.wait_timeout(Duration::from_millis(10)));

        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_latch_wakes_all_waiters() {
        let latch = Arc::new(Latch::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait())
            })
            .collect();

        latch.fire();
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_gate_open_receiver_is_ready() {
        let gate = Gate::open();
        assert!(gate.is_open());
        assert!(matches!(
            gate.receiver().try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_gate_stop_then_start() {
        let gate = Gate::open();
        gate.stop();
        assert!(!gate.is_open());

        let rx = gate.receiver();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        gate.start();
        assert!(gate.is_open());
        // the receiver handed out while closed wakes up too
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_gate_stop_is_idempotent() {
        let gate = Gate::open();
        gate.stop();
        let rx = gate.receiver();
        gate.stop();
        gate.start();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }
}
