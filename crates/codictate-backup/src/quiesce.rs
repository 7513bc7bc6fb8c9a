//! Quiesce gate over the active-data write path.
//!
//! Normal application writes hold a [`WriteGuard`] for their duration. A
//! restore engages the gate with [`WriteGate::quiesce`]: new writes are
//! rejected with [`BackupError::RestoreInProgress`] at once (never queued),
//! and the restore waits for in-flight writes up to a timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{BackupError, Result};

#[derive(Debug, Default)]
struct GateState {
    quiesced: bool,
    in_flight: usize,
}

/// Exclusive gate between application writers and a restore.
#[derive(Debug, Default)]
pub struct WriteGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl WriteGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start an application write.
    ///
    /// Fails with [`BackupError::RestoreInProgress`] while quiesced.
    pub fn begin_write(self: &Arc<Self>) -> Result<WriteGuard> {
        let mut state = self.state.lock();
        if state.quiesced {
            debug!("write rejected: restore in progress");
            return Err(BackupError::RestoreInProgress);
        }
        state.in_flight += 1;
        Ok(WriteGuard {
            gate: Arc::clone(self),
        })
    }

    /// Reject new writes and wait for in-flight writes to drain.
    ///
    /// On timeout the gate is reopened and [`BackupError::QuiesceTimeout`] is
    /// returned; nothing else changes.
    pub fn quiesce(self: &Arc<Self>, timeout: Duration) -> Result<QuiesceGuard> {
        let started = Instant::now();
        let mut state = self.state.lock();
        state.quiesced = true;

        let waited = self
            .drained
            .wait_while_for(&mut state, |s| s.in_flight > 0, timeout);
        if waited.timed_out() && state.in_flight > 0 {
            state.quiesced = false;
            warn!(
                in_flight = state.in_flight,
                timeout_ms = timeout.as_millis() as u64,
                "quiesce timed out"
            );
            return Err(BackupError::QuiesceTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        info!(
            wait_ms = started.elapsed().as_millis() as u64,
            "active data quiesced"
        );
        Ok(QuiesceGuard {
            gate: Arc::clone(self),
        })
    }

    /// Whether writes are currently rejected.
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.state.lock().quiesced
    }

    /// Number of writes in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

/// Held by an application writer; releases its slot on drop.
#[derive(Debug)]
pub struct WriteGuard {
    gate: Arc<WriteGate>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.gate.drained.notify_all();
        }
    }
}

/// Held by a restore between `Quiesce` and the end of commit or rollback.
#[derive(Debug)]
pub struct QuiesceGuard {
    gate: Arc<WriteGate>,
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        self.gate.state.lock().quiesced = false;
        debug!("active data writes resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_writes_rejected_while_quiesced() {
        let gate = WriteGate::new();
        let quiesced = gate.quiesce(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            gate.begin_write(),
            Err(BackupError::RestoreInProgress)
        ));
        drop(quiesced);
        assert!(gate.begin_write().is_ok());
    }

    #[test]
    fn test_timeout_reopens_gate() {
        let gate = WriteGate::new();
        let writer = gate.begin_write().unwrap();

        let err = gate.quiesce(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, BackupError::QuiesceTimeout { timeout_ms: 20 }));
        assert!(!gate.is_quiesced());
        drop(writer);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_waits_for_in_flight_write() {
        let gate = WriteGate::new();
        let writer = gate.begin_write().unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(writer);
        });

        let guard = gate.quiesce(Duration::from_secs(5)).unwrap();
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.is_quiesced());
        drop(guard);
        handle.join().unwrap();
    }
}
