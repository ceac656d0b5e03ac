//! Integration tests for the measurement cycle
//!
//! Every test drives a `SimulatedSensor` through the registry and engine the
//! same way a device read would, and checks the result bytes, the error kind
//! and the hardware effects the cycle left behind.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hcsr04_daq::capture::CaptureSnapshot;
use hcsr04_daq::engine::{Interrupt, MeasurementEngine, MeasurementObserver, MeasurementState};
use hcsr04_daq::hardware::mock::{EchoResponse, Fault, SimulatedSensor};
use hcsr04_daq::registry::{AttachRequest, DeviceRegistry};
use hcsr04_daq::slot::DeviceSlot;
use hcsr04_daq::{ErrorKind, SonarError};
use parking_lot::Mutex;

fn attached(response: EchoResponse) -> (SimulatedSensor, Arc<DeviceSlot>, DeviceRegistry) {
    let registry = DeviceRegistry::new(4, 240);
    let sensor = SimulatedSensor::new(response);
    let (echo, trigger) = sensor.lines();
    let number = registry
        .attach(
            AttachRequest::new("bench-0")
                .label("bench")
                .echo(echo)
                .trigger(trigger),
        )
        .unwrap();
    let slot = registry.find_by_identity(number).unwrap();
    (sensor, slot, registry)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(MeasurementState, CaptureSnapshot)>>,
}

impl MeasurementObserver for Recorder {
    fn on_transition(&self, _slot: usize, state: MeasurementState, capture: CaptureSnapshot) {
        self.events.lock().push((state, capture));
    }
}

// =============================================================================
// Successful readings
// =============================================================================

#[test]
fn test_end_to_end_120mm() {
    let (sensor, slot, _registry) = attached(EchoResponse::Echo {
        round_trip_ns: 6_360_000,
    });
    let engine = MeasurementEngine::default();

    let mut buf = [0u8; 2];
    let written = engine.measure(&slot, Some(&mut buf), None).unwrap();

    assert_eq!(written, 2);
    assert_eq!(buf, [0x00, 0x78]);

    let pulses = sensor.pulses();
    assert_eq!(pulses.len(), 1);
    assert!(pulses[0].width() >= Duration::from_micros(10));
    assert_eq!(sensor.active_subscriptions(), 0);
    assert_eq!(sensor.total_subscriptions(), 1);
}

#[test]
fn test_envelope_boundaries() {
    let (sensor, slot, _registry) = attached(EchoResponse::distance_mm(6));
    let engine = MeasurementEngine::default();

    assert_eq!(engine.measure_distance(&slot, None).unwrap(), 6);

    sensor.set_response(EchoResponse::distance_mm(4999));
    assert_eq!(engine.measure_distance(&slot, None).unwrap(), 4999);

    for rejected in [5, 5000] {
        sensor.set_response(EchoResponse::distance_mm(rejected));
        let err = engine.measure_distance(&slot, None).unwrap_err();
        assert!(
            matches!(err, SonarError::OutOfRange { distance_mm } if distance_mm == rejected),
            "{rejected} mm should be out of range, got {err:?}"
        );
    }
}

#[test]
fn test_readings_across_envelope() {
    let (sensor, slot, _registry) = attached(EchoResponse::distance_mm(21));
    let engine = MeasurementEngine::default();

    for mm in [21u16, 255, 256, 1000, 4985] {
        sensor.set_response(EchoResponse::distance_mm(i64::from(mm)));
        let mut buf = [0u8; 2];
        engine.measure(&slot, Some(&mut buf), None).unwrap();
        assert_eq!(buf, mm.to_be_bytes());
    }
}

#[test]
fn test_state_sequence_and_reset() {
    let (_sensor, slot, _registry) = attached(EchoResponse::distance_mm(120));
    let recorder = Arc::new(Recorder::default());
    let engine = MeasurementEngine::default().with_observer(recorder.clone());

    engine.measure_distance(&slot, None).unwrap();
    engine.measure_distance(&slot, None).unwrap();

    let events = recorder.events.lock();
    let states: Vec<_> = events.iter().map(|(state, _)| *state).collect();
    let cycle = [
        MeasurementState::Idle,
        MeasurementState::Armed,
        MeasurementState::Triggered,
        MeasurementState::AwaitingEcho,
        MeasurementState::ResolvedOk,
    ];
    assert_eq!(states[..5], cycle);
    assert_eq!(states[5..], cycle);

    // The second cycle starts with the first cycle's timestamps still in place
    // and must clear them on arming.
    assert!(!events[5].1.is_clear());
    for (state, snapshot) in events.iter() {
        if *state == MeasurementState::Armed {
            assert!(snapshot.is_clear(), "timestamps not reset: {snapshot:?}");
        }
    }
    assert_eq!(events[9].1.elapsed_ns(), Some(120 * 53_000));
}

// =============================================================================
// Rejected requests
// =============================================================================

#[test]
fn test_bad_buffer_touches_no_hardware() {
    let (sensor, slot, _registry) = attached(EchoResponse::distance_mm(120));
    let engine = MeasurementEngine::default();

    let mut short = [0u8; 1];
    let mut long = [0u8; 3];
    for buf in [Some(&mut short[..]), Some(&mut long[..]), None] {
        let err = engine.measure(&slot, buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    assert!(sensor.pulses().is_empty());
    assert_eq!(sensor.total_subscriptions(), 0);
}

#[test]
fn test_pin_failures_are_io_and_unsubscribe() {
    let (sensor, slot, _registry) = attached(EchoResponse::distance_mm(120));
    let engine = MeasurementEngine::default();

    sensor.inject(Fault::Subscribe);
    let err = engine.measure_distance(&slot, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(sensor.pulses().is_empty());
    sensor.clear_faults();

    for fault in [Fault::TriggerHigh, Fault::TriggerLow] {
        sensor.inject(fault);
        let mut buf = [0xAAu8; 2];
        let err = engine.measure(&slot, Some(&mut buf), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure, "{fault:?}");
        assert_eq!(buf, [0xAA, 0xAA]);
        assert_eq!(sensor.active_subscriptions(), 0);
        sensor.clear_faults();
    }

    assert_eq!(engine.measure_distance(&slot, None).unwrap(), 120);
}

// =============================================================================
// Timeout and cancellation
// =============================================================================

#[test]
fn test_timeout_leaves_slot_reusable() {
    let (sensor, slot, _registry) = attached(EchoResponse::Silent);
    let engine = MeasurementEngine::new(Duration::from_millis(30));

    let mut buf = [0xAAu8; 2];
    let start = Instant::now();
    let err = engine.measure(&slot, Some(&mut buf), None).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(
        err,
        SonarError::Timeout {
            interrupted: false,
            ..
        }
    ));
    assert!(elapsed >= Duration::from_millis(30));
    println!("Timeout resolved after {:?}", elapsed);
    assert_eq!(buf, [0xAA, 0xAA]);
    assert_eq!(sensor.active_subscriptions(), 0);

    sensor.set_response(EchoResponse::distance_mm(300));
    engine.measure(&slot, Some(&mut buf), None).unwrap();
    assert_eq!(u16::from_be_bytes(buf), 300);
}

#[test]
fn test_falling_edge_without_rising_times_out() {
    let (sensor, slot, _registry) = attached(EchoResponse::FallingOnly);
    let engine = MeasurementEngine::new(Duration::from_millis(30));

    let err = engine.measure_distance(&slot, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(slot.capture().anomalies(), 1);
    assert_eq!(sensor.active_subscriptions(), 0);
}

#[test]
fn test_interrupt_resolves_as_timeout() {
    let (sensor, slot, _registry) = attached(EchoResponse::Silent);
    let engine = MeasurementEngine::new(Duration::from_secs(5));
    let interrupt = Interrupt::new();

    let raiser = interrupt.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        raiser.raise();
    });

    let start = Instant::now();
    let err = engine.measure_distance(&slot, Some(&interrupt)).unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(
        err,
        SonarError::Timeout {
            interrupted: true,
            ..
        }
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(sensor.active_subscriptions(), 0);

    // A raised token keeps cancelling until cleared
    assert!(engine.measure_distance(&slot, Some(&interrupt)).is_err());
    interrupt.clear();
    sensor.set_response(EchoResponse::distance_mm(42));
    assert_eq!(engine.measure_distance(&slot, Some(&interrupt)).unwrap(), 42);
}
