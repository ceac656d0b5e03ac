//! Measurement engine: one trigger/capture/validate cycle per request.
//!
//! ```text
//! Idle → Armed → Triggered → AwaitingEcho → ResolvedOk
//!                                          → ResolvedTimeout
//!                                          → ResolvedError
//! ```
//!
//! A cycle holds the slot lock from start to finish:
//!
//! 1. Reject an unbound slot (`NoDevice`) or a buffer that is not exactly
//!    [`RESULT_LEN`] bytes (`InvalidArgument`) before touching hardware.
//! 2. Subscribe the slot's [`EdgeCapture`] to the echo line.
//! 3. Arm: reset completion and both timestamps.
//! 4. Drive the trigger high, spin for the pulse width, drive it low.
//! 5. Wait for completion until the deadline or an [`Interrupt`].
//! 6. Unsubscribe, then validate and encode the distance.
//!
//! The subscription is an RAII guard, so every early return unsubscribes.
//!
//! [`EdgeCapture`]: crate::capture::EdgeCapture

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info_span, warn};

pub use crate::capture::Interrupt;
use crate::capture::{CaptureSnapshot, WaitOutcome};
use crate::error::{Result, SonarError};
use crate::hardware::{Level, TriggerLine};
use crate::slot::{Binding, DeviceSlot};

/// Default echo deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default trigger pulse width.
pub const DEFAULT_PULSE_WIDTH: Duration = Duration::from_micros(10);

/// Shortest accepted trigger pulse.
pub const MIN_PULSE_WIDTH: Duration = Duration::from_micros(10);

/// Longest accepted trigger pulse.
pub const MAX_PULSE_WIDTH: Duration = Duration::from_micros(20);

/// Size of an encoded result.
pub const RESULT_LEN: usize = 2;

/// Distances at or below this are rejected (mm).
pub const MIN_DISTANCE_MM: i64 = 5;

/// Distances at or above this are rejected (mm).
pub const MAX_DISTANCE_MM: i64 = 5000;

/// Round-trip microseconds per millimeter of distance.
const US_PER_MM: i64 = 53;

/// Measurement cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementState {
    /// Slot locked, request accepted.
    Idle,
    /// Subscribed, completion and timestamps reset.
    Armed,
    /// Trigger pulse sent.
    Triggered,
    /// Waiting on completion.
    AwaitingEcho,
    /// Distance encoded.
    ResolvedOk,
    /// Deadline passed or interrupted.
    ResolvedTimeout,
    /// Any other failure.
    ResolvedError,
}

impl MeasurementState {
    /// True for the three resolved states.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::ResolvedOk | Self::ResolvedTimeout | Self::ResolvedError
        )
    }
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Triggered => "triggered",
            Self::AwaitingEcho => "awaiting_echo",
            Self::ResolvedOk => "resolved_ok",
            Self::ResolvedTimeout => "resolved_timeout",
            Self::ResolvedError => "resolved_error",
        };
        f.write_str(name)
    }
}

/// Receives every state transition of every measurement.
///
/// Called on the measuring thread with the slot lock held. Must not block.
pub trait MeasurementObserver: Send + Sync {
    /// `slot` entered `state`; `capture` holds the timestamps at that moment.
    fn on_transition(&self, slot: usize, state: MeasurementState, capture: CaptureSnapshot);
}

/// Convert an echo high time to millimeters.
pub fn distance_from_elapsed(elapsed_ns: i64) -> i64 {
    (elapsed_ns / 1000) / US_PER_MM
}

/// Accept `distance_mm` if strictly inside the sensor envelope.
pub fn validate_distance(distance_mm: i64) -> Result<u16> {
    if distance_mm > MIN_DISTANCE_MM && distance_mm < MAX_DISTANCE_MM {
        u16::try_from(distance_mm).map_err(|_| SonarError::OutOfRange { distance_mm })
    } else {
        Err(SonarError::OutOfRange { distance_mm })
    }
}

/// Big-endian wire form of a distance.
pub fn encode_distance(distance_mm: u16) -> [u8; RESULT_LEN] {
    distance_mm.to_be_bytes()
}

/// Inverse of [`encode_distance`].
pub fn decode_distance(bytes: [u8; RESULT_LEN]) -> u16 {
    u16::from_be_bytes(bytes)
}

fn spin_for(width: Duration) {
    let start = Instant::now();
    while start.elapsed() < width {
        std::hint::spin_loop();
    }
}

/// Runs measurement cycles against device slots.
#[derive(Clone)]
pub struct MeasurementEngine {
    timeout: Duration,
    pulse_width: Duration,
    observer: Option<Arc<dyn MeasurementObserver>>,
}

impl MeasurementEngine {
    /// Engine with echo deadline `timeout` and the default pulse width.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pulse_width: DEFAULT_PULSE_WIDTH,
            observer: None,
        }
    }

    /// Set the trigger pulse width. Must be within 10..=20 µs.
    pub fn with_pulse_width(mut self, width: Duration) -> Result<Self> {
        if !(MIN_PULSE_WIDTH..=MAX_PULSE_WIDTH).contains(&width) {
            return Err(SonarError::InvalidArgument(format!(
                "pulse width {width:?} outside {MIN_PULSE_WIDTH:?}..={MAX_PULSE_WIDTH:?}"
            )));
        }
        self.pulse_width = width;
        Ok(self)
    }

    /// Attach a state observer.
    pub fn with_observer(mut self, observer: Arc<dyn MeasurementObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Echo deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Trigger pulse width.
    pub fn pulse_width(&self) -> Duration {
        self.pulse_width
    }

    /// Run one cycle and write the big-endian distance into `buf`.
    ///
    /// Returns the number of bytes written (always [`RESULT_LEN`]). On any
    /// error `buf` is left untouched.
    pub fn measure(
        &self,
        slot: &DeviceSlot,
        buf: Option<&mut [u8]>,
        interrupt: Option<&Interrupt>,
    ) -> Result<usize> {
        self.measure_bound(slot, None, buf, interrupt)
    }

    /// Run one cycle and return the distance in millimeters.
    pub fn measure_distance(&self, slot: &DeviceSlot, interrupt: Option<&Interrupt>) -> Result<u16> {
        let mut buf = [0u8; RESULT_LEN];
        self.measure(slot, Some(&mut buf), interrupt)?;
        Ok(decode_distance(buf))
    }

    /// [`measure`](Self::measure), additionally requiring the slot to still
    /// hold binding `generation`.
    pub(crate) fn measure_bound(
        &self,
        slot: &DeviceSlot,
        generation: Option<u64>,
        buf: Option<&mut [u8]>,
        interrupt: Option<&Interrupt>,
    ) -> Result<usize> {
        let span = info_span!("measure", slot = slot.index());
        let _enter = span.enter();

        let mut guard = slot.lock();
        let result = self.run(slot, guard.as_mut(), generation, buf, interrupt);

        let resolved = match &result {
            Ok(_) => MeasurementState::ResolvedOk,
            Err(SonarError::Timeout { .. }) => MeasurementState::ResolvedTimeout,
            Err(_) => MeasurementState::ResolvedError,
        };
        self.notify(slot, resolved);
        match &result {
            Ok(_) => debug!(state = %resolved, "Measurement complete"),
            Err(e) => debug!(state = %resolved, error = %e, "Measurement failed"),
        }

        drop(guard);
        result
    }

    fn run(
        &self,
        slot: &DeviceSlot,
        binding: Option<&mut Binding>,
        generation: Option<u64>,
        buf: Option<&mut [u8]>,
        interrupt: Option<&Interrupt>,
    ) -> Result<usize> {
        let binding = match binding {
            Some(b) if generation.map_or(true, |g| g == b.generation) => b,
            Some(b) => return Err(SonarError::NoDevice(b.identity.to_string())),
            None => return Err(SonarError::NoDevice(format!("slot {}", slot.index()))),
        };

        let buf = match buf {
            Some(buf) if buf.len() == RESULT_LEN => buf,
            Some(buf) => {
                return Err(SonarError::InvalidArgument(format!(
                    "read buffer must be {RESULT_LEN} bytes, got {}",
                    buf.len()
                )))
            }
            None => {
                return Err(SonarError::InvalidArgument(
                    "read buffer missing".to_string(),
                ))
            }
        };
        self.notify(slot, MeasurementState::Idle);

        let capture = slot.capture();
        let handler_capture = Arc::clone(capture);
        let subscription = binding
            .echo
            .subscribe(Arc::new(move |event| handler_capture.on_edge(event)))
            .map_err(|e| {
                error!(error = %e, "Echo edge subscription failed");
                SonarError::io("echo subscribe", e)
            })?;

        capture.arm();
        self.notify(slot, MeasurementState::Armed);

        self.pulse(binding.trigger.as_mut())?;
        self.notify(slot, MeasurementState::Triggered);

        let outcome = {
            let _interrupt_guard = interrupt.map(|i| i.guard(capture));
            self.notify(slot, MeasurementState::AwaitingEcho);
            let started = Instant::now();
            let outcome = capture.wait_until(started + self.timeout);
            (outcome, started.elapsed())
        };
        drop(subscription);

        match outcome {
            (WaitOutcome::Completed, _) => {}
            (WaitOutcome::TimedOut, waited) => {
                warn!(?waited, "No echo before deadline");
                return Err(SonarError::Timeout {
                    waited,
                    interrupted: false,
                });
            }
            (WaitOutcome::Interrupted, waited) => {
                warn!(?waited, "Echo wait interrupted");
                return Err(SonarError::Timeout {
                    waited,
                    interrupted: true,
                });
            }
        }

        let snapshot = capture.snapshot();
        let (Some(start), Some(end)) = (snapshot.start_ns, snapshot.end_ns) else {
            return Err(SonarError::CaptureIncomplete {
                start_recorded: snapshot.start_ns.is_some(),
                end_recorded: snapshot.end_ns.is_some(),
            });
        };

        let elapsed_ns = end.checked_sub(start).ok_or_else(|| {
            warn!(start, end, "Echo timestamps do not fit a duration");
            SonarError::OutOfRange {
                distance_mm: if end < start { i64::MIN } else { i64::MAX },
            }
        })?;
        let distance_mm = distance_from_elapsed(elapsed_ns);
        debug!(elapsed_ns, distance_mm, "Echo captured");
        let distance = validate_distance(distance_mm)?;

        buf.copy_from_slice(&encode_distance(distance));
        Ok(RESULT_LEN)
    }

    fn pulse(&self, trigger: &mut dyn TriggerLine) -> Result<()> {
        trigger.set_level(Level::High).map_err(|e| {
            error!(error = %e, "Failed to drive trigger high");
            SonarError::io("trigger high", e)
        })?;
        spin_for(self.pulse_width);
        trigger.set_level(Level::Low).map_err(|e| {
            error!(error = %e, "Failed to drive trigger low");
            SonarError::io("trigger low", e)
        })
    }

    fn notify(&self, slot: &DeviceSlot, state: MeasurementState) {
        if let Some(observer) = &self.observer {
            observer.on_transition(slot.index(), state, slot.capture().snapshot());
        }
    }
}

impl Default for MeasurementEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl fmt::Debug for MeasurementEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementEngine")
            .field("timeout", &self.timeout)
            .field("pulse_width", &self.pulse_width)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
