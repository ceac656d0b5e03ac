//! Edge capture handler and the completion signal it drives.
//!
//! Each slot owns one [`EdgeCapture`]. While a measurement is in flight the
//! echo line calls [`EdgeCapture::on_edge`] from its own context:
//!
//! - rising edge: store the start timestamp
//! - falling edge: if a start is stored, store the end timestamp and signal
//!   completion; otherwise count an ordering anomaly and do nothing else
//!
//! The handler is the only writer of the timestamps and the measuring thread
//! the only reader. Writes use `Release`, reads `Acquire`, and the completion
//! mutex orders the last write before the waiter wakes.
//!
//! [`Interrupt`] lets another thread cut a wait short. An interrupted wait is
//! reported like a timeout.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::hardware::{Edge, EdgeEvent};

/// Timestamp value meaning "not recorded in this measurement".
pub const UNSET: i64 = i64::MIN;

/// How a completion wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Completion was signaled.
    Completed,
    /// Deadline passed first.
    TimedOut,
    /// An [`Interrupt`] was raised first.
    Interrupted,
}

#[derive(Default)]
struct CompletionState {
    done: bool,
    interrupted: bool,
}

/// Single-shot signal with one writer and one waiter.
#[derive(Default)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    /// New, unsignaled completion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear both the done and the interrupted flag.
    pub fn reset(&self) {
        *self.state.lock() = CompletionState::default();
    }

    /// Signal the waiter.
    pub fn complete(&self) {
        self.state.lock().done = true;
        self.cond.notify_all();
    }

    /// Wake the waiter without completing.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.cond.notify_all();
    }

    /// True once [`complete`](Self::complete) ran since the last reset.
    pub fn is_complete(&self) -> bool {
        self.state.lock().done
    }

    /// Block until signaled, interrupted or `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        let mut state = self.state.lock();
        loop {
            if state.done {
                return WaitOutcome::Completed;
            }
            if state.interrupted {
                return WaitOutcome::Interrupted;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.done {
                    WaitOutcome::Completed
                } else if state.interrupted {
                    WaitOutcome::Interrupted
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }
}

/// Timestamps recorded for the current measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureSnapshot {
    /// Rising edge timestamp (ns).
    pub start_ns: Option<i64>,
    /// Falling edge timestamp (ns).
    pub end_ns: Option<i64>,
}

impl CaptureSnapshot {
    /// End minus start, when both are recorded and the difference fits.
    pub fn elapsed_ns(&self) -> Option<i64> {
        self.end_ns?.checked_sub(self.start_ns?)
    }

    /// Neither timestamp recorded.
    pub fn is_clear(&self) -> bool {
        self.start_ns.is_none() && self.end_ns.is_none()
    }
}

fn load(cell: &AtomicI64) -> Option<i64> {
    match cell.load(Ordering::Acquire) {
        UNSET => None,
        value => Some(value),
    }
}

/// Per-slot echo capture state.
pub struct EdgeCapture {
    slot: usize,
    start_ns: AtomicI64,
    end_ns: AtomicI64,
    anomalies: AtomicU64,
    completion: Completion,
}

impl EdgeCapture {
    /// Capture state for slot `slot`.
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            start_ns: AtomicI64::new(UNSET),
            end_ns: AtomicI64::new(UNSET),
            anomalies: AtomicU64::new(0),
            completion: Completion::new(),
        }
    }

    /// Reset completion and both timestamps before a measurement.
    pub fn arm(&self) {
        self.completion.reset();
        self.start_ns.store(UNSET, Ordering::Release);
        self.end_ns.store(UNSET, Ordering::Release);
    }

    /// Edge handler body.
    pub fn on_edge(&self, event: EdgeEvent) {
        match event.edge {
            Edge::Rising => {
                trace!(slot = self.slot, ts = event.timestamp_ns, "Echo rising edge");
                self.start_ns.store(event.timestamp_ns, Ordering::Release);
            }
            Edge::Falling => {
                if load(&self.start_ns).is_some() {
                    trace!(slot = self.slot, ts = event.timestamp_ns, "Echo falling edge");
                    self.end_ns.store(event.timestamp_ns, Ordering::Release);
                    self.completion.complete();
                } else {
                    self.anomalies.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        slot = self.slot,
                        ts = event.timestamp_ns,
                        "Echo falling edge observed before rising edge"
                    );
                }
            }
        }
    }

    /// Current timestamps.
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            start_ns: load(&self.start_ns),
            end_ns: load(&self.end_ns),
        }
    }

    /// Falling edges seen without a start, over the slot's lifetime.
    pub fn anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    /// Block until the echo completes, an interrupt arrives, or `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        self.completion.wait_until(deadline)
    }

    pub(crate) fn interrupt(&self) {
        self.completion.interrupt();
    }
}

#[derive(Default)]
struct InterruptInner {
    raised: AtomicBool,
    targets: Mutex<Vec<Arc<EdgeCapture>>>,
}

/// Cancellation token for a blocking measurement.
///
/// Raising it wakes every measurement currently waiting under it (and any
/// started later, until [`clear`](Self::clear) is called). One token may
/// guard measurements on several slots at once.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

impl Interrupt {
    /// New, unraised token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every guarded wait.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        for capture in self.inner.targets.lock().iter() {
            capture.interrupt();
        }
    }

    /// True after [`raise`](Self::raise) until [`clear`](Self::clear).
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Re-arm the token for reuse.
    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    /// Route raises to `capture` until the guard drops.
    pub(crate) fn guard(&self, capture: &Arc<EdgeCapture>) -> InterruptGuard<'_> {
        let mut targets = self.inner.targets.lock();
        targets.push(Arc::clone(capture));
        if self.is_raised() {
            capture.interrupt();
        }
        InterruptGuard {
            interrupt: self,
            capture: Arc::clone(capture),
        }
    }

    #[cfg(test)]
    fn guarded(&self) -> usize {
        self.inner.targets.lock().len()
    }
}

pub(crate) struct InterruptGuard<'a> {
    interrupt: &'a Interrupt,
    capture: Arc<EdgeCapture>,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        let mut targets = self.interrupt.inner.targets.lock();
        if let Some(pos) = targets.iter().position(|c| Arc::ptr_eq(c, &self.capture)) {
            targets.swap_remove(pos);
        }
    }
}
