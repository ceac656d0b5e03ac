//! Simulated HC-SR04 for testing without physical hardware.
//!
//! [`SimulatedSensor`] hands out a paired [`MockTriggerLine`] and
//! [`MockEchoLine`]. Each completed trigger pulse (high then low) makes the
//! sensor answer from a background thread, the way a real echo line fires
//! edge interrupts asynchronously to the caller.
//!
//! # Responses
//!
//! - [`EchoResponse::Echo`] - rising edge, then falling edge `round_trip_ns`
//!   later (timestamps are synthetic, so distances are exact)
//! - [`EchoResponse::Silent`] - no edges at all
//! - [`EchoResponse::FallingOnly`] - a falling edge with no rising edge
//!
//! # Fault injection
//!
//! [`Fault`] makes the next and all following calls of one operation fail
//! until [`SimulatedSensor::clear_faults`] is called.
//!
//! # Example
//!
//! ```rust
//! use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedSensor};
//!
//! let sensor = SimulatedSensor::new(EchoResponse::distance_mm(120));
//! let (echo, trigger) = sensor.lines();
//! # drop((echo, trigger));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::hardware::clock::monotonic_ns;
use crate::hardware::{
    EchoLine, Edge, EdgeEvent, EdgeHandler, EdgeSubscription, Level, LineProvider, LinePair,
    PinError, TriggerLine,
};

/// Nanoseconds of echo per millimeter, matching the engine's conversion.
const ECHO_NS_PER_MM: i64 = 53_000;

/// How the simulated sensor answers a trigger pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoResponse {
    /// Echo high for `round_trip_ns`.
    Echo {
        /// Time between rising and falling edge.
        round_trip_ns: i64,
    },
    /// No echo (target out of range, sensor unplugged).
    Silent,
    /// Falling edge without a preceding rising edge.
    FallingOnly,
}

impl EchoResponse {
    /// Echo that converts to exactly `mm` millimeters.
    pub fn distance_mm(mm: i64) -> Self {
        Self::Echo {
            round_trip_ns: mm * ECHO_NS_PER_MM,
        }
    }
}

/// Operation to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// [`EchoLine::subscribe`] fails.
    Subscribe,
    /// Driving the trigger high fails.
    TriggerHigh,
    /// Driving the trigger low fails.
    TriggerLow,
}

/// Trigger pulse observed by the sensor.
#[derive(Debug, Clone, Copy)]
pub struct PulseRecord {
    /// Trigger went high.
    pub rose_at: Instant,
    /// Trigger went low.
    pub fell_at: Instant,
}

impl PulseRecord {
    /// Pulse width.
    pub fn width(&self) -> Duration {
        self.fell_at.saturating_duration_since(self.rose_at)
    }
}

#[derive(Default)]
struct Faults {
    subscribe: bool,
    trigger_high: bool,
    trigger_low: bool,
}

impl Faults {
    fn set(&mut self, fault: Fault, enabled: bool) {
        match fault {
            Fault::Subscribe => self.subscribe = enabled,
            Fault::TriggerHigh => self.trigger_high = enabled,
            Fault::TriggerLow => self.trigger_low = enabled,
        }
    }
}

struct TriggerState {
    level: Level,
    rose_at: Option<Instant>,
}

struct SensorInner {
    /// Held while a handler runs so unsubscription waits for it.
    handler: Mutex<Option<EdgeHandler>>,
    response: Mutex<EchoResponse>,
    latency: Mutex<Duration>,
    faults: Mutex<Faults>,
    trigger: Mutex<TriggerState>,
    echo_level: Mutex<Level>,
    pulses: Mutex<Vec<PulseRecord>>,
    active_subscriptions: AtomicUsize,
    total_subscriptions: AtomicUsize,
}

impl SensorInner {
    fn emit(&self, event: EdgeEvent) {
        *self.echo_level.lock() = match event.edge {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
        };
        let handler = self.handler.lock();
        match handler.as_ref() {
            Some(handler) => handler(event),
            None => trace!(?event, "Edge with no subscriber dropped"),
        }
    }

    fn respond(self: &Arc<Self>) {
        let response = *self.response.lock();
        let latency = *self.latency.lock();
        let inner = Arc::clone(self);
        thread::spawn(move || {
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            match response {
                EchoResponse::Echo { round_trip_ns } => {
                    let start = monotonic_ns();
                    inner.emit(EdgeEvent::rising(start));
                    inner.emit(EdgeEvent::falling(start + round_trip_ns));
                }
                EchoResponse::FallingOnly => inner.emit(EdgeEvent::falling(monotonic_ns())),
                EchoResponse::Silent => {}
            }
        });
    }
}

/// Simulated ultrasonic sensor with scripted echo responses.
///
/// Cloning shares the same simulated device.
#[derive(Clone)]
pub struct SimulatedSensor {
    inner: Arc<SensorInner>,
}

impl SimulatedSensor {
    /// Sensor answering every pulse with `response` after 200 µs.
    pub fn new(response: EchoResponse) -> Self {
        Self {
            inner: Arc::new(SensorInner {
                handler: Mutex::new(None),
                response: Mutex::new(response),
                latency: Mutex::new(Duration::from_micros(200)),
                faults: Mutex::new(Faults::default()),
                trigger: Mutex::new(TriggerState {
                    level: Level::Low,
                    rose_at: None,
                }),
                echo_level: Mutex::new(Level::Low),
                pulses: Mutex::new(Vec::new()),
                active_subscriptions: AtomicUsize::new(0),
                total_subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay between the end of the trigger pulse and the first edge.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = latency;
        self
    }

    /// Echo and trigger lines wired to this sensor.
    pub fn lines(&self) -> (MockEchoLine, MockTriggerLine) {
        (
            MockEchoLine {
                inner: Arc::clone(&self.inner),
            },
            MockTriggerLine {
                inner: Arc::clone(&self.inner),
            },
        )
    }

    /// Change the answer to following pulses.
    pub fn set_response(&self, response: EchoResponse) {
        *self.inner.response.lock() = response;
    }

    /// Make `fault` fail until cleared.
    pub fn inject(&self, fault: Fault) {
        self.inner.faults.lock().set(fault, true);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    /// Deliver an edge to the current subscriber, if any.
    pub fn emit(&self, event: EdgeEvent) {
        self.inner.emit(event);
    }

    /// Trigger pulses seen so far.
    pub fn pulses(&self) -> Vec<PulseRecord> {
        self.inner.pulses.lock().clone()
    }

    /// Current trigger level.
    pub fn trigger_level(&self) -> Level {
        self.inner.trigger.lock().level
    }

    /// Subscriptions currently held on the echo line (0 or 1).
    pub fn active_subscriptions(&self) -> usize {
        self.inner.active_subscriptions.load(Ordering::SeqCst)
    }

    /// Subscriptions ever created on the echo line.
    pub fn total_subscriptions(&self) -> usize {
        self.inner.total_subscriptions.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(EchoResponse::distance_mm(1000))
    }
}

/// Trigger input of a [`SimulatedSensor`].
pub struct MockTriggerLine {
    inner: Arc<SensorInner>,
}

impl TriggerLine for MockTriggerLine {
    fn set_level(&mut self, level: Level) -> Result<(), PinError> {
        {
            let faults = self.inner.faults.lock();
            let failing = match level {
                Level::High => faults.trigger_high,
                Level::Low => faults.trigger_low,
            };
            if failing {
                return Err(PinError::Backend(format!(
                    "simulated failure driving trigger {level}"
                )));
            }
        }

        let mut trigger = self.inner.trigger.lock();
        let previous = trigger.level;
        trigger.level = level;
        match (previous, level) {
            (Level::Low, Level::High) => trigger.rose_at = Some(Instant::now()),
            (Level::High, Level::Low) => {
                if let Some(rose_at) = trigger.rose_at.take() {
                    self.inner.pulses.lock().push(PulseRecord {
                        rose_at,
                        fell_at: Instant::now(),
                    });
                    drop(trigger);
                    self.inner.respond();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Echo output of a [`SimulatedSensor`].
pub struct MockEchoLine {
    inner: Arc<SensorInner>,
}

impl EchoLine for MockEchoLine {
    fn level(&self) -> Result<Level, PinError> {
        Ok(*self.inner.echo_level.lock())
    }

    fn subscribe(&mut self, handler: EdgeHandler) -> Result<EdgeSubscription, PinError> {
        if self.inner.faults.lock().subscribe {
            return Err(PinError::Backend(
                "simulated edge subscription failure".into(),
            ));
        }

        let mut slot = self.inner.handler.lock();
        if slot.is_some() {
            return Err(PinError::AlreadySubscribed);
        }
        *slot = Some(handler);
        drop(slot);

        self.inner.active_subscriptions.fetch_add(1, Ordering::SeqCst);
        self.inner.total_subscriptions.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        Ok(EdgeSubscription::new(move || {
            inner.handler.lock().take();
            inner.active_subscriptions.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

/// [`LineProvider`] handing out one [`SimulatedSensor`] per pin pair.
pub struct SimulatedLines {
    response: EchoResponse,
    sensors: Vec<(u8, SimulatedSensor)>,
}

impl SimulatedLines {
    /// Provider whose sensors all start with `response`.
    pub fn new(response: EchoResponse) -> Self {
        Self {
            response,
            sensors: Vec::new(),
        }
    }

    /// Sensor created for echo pin `echo_gpio`.
    pub fn sensor(&self, echo_gpio: u8) -> Option<&SimulatedSensor> {
        self.sensors
            .iter()
            .find(|(pin, _)| *pin == echo_gpio)
            .map(|(_, sensor)| sensor)
    }
}

impl LineProvider for SimulatedLines {
    fn open(&mut self, echo_gpio: u8, trigger_gpio: u8) -> Result<LinePair, PinError> {
        if self.sensor(echo_gpio).is_some() {
            return Err(PinError::Unavailable {
                pin: echo_gpio,
                message: "already claimed".into(),
            });
        }
        let sensor = SimulatedSensor::new(self.response);
        let (echo, trigger) = sensor.lines();
        trace!(echo_gpio, trigger_gpio, "Simulated sensor created");
        self.sensors.push((echo_gpio, sensor));
        Ok((Box::new(echo), Box::new(trigger)))
    }
}
