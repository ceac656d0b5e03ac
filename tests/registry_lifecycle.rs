//! Integration tests for attach, detach and open/close through the driver
//!
//! These cover the slot pool limits, the two lookup keys and what happens to
//! open handles and in-flight measurements when a sensor goes away.

use std::thread;
use std::time::{Duration, Instant};

use hcsr04_daq::driver::SonarDriver;
use hcsr04_daq::engine::MeasurementEngine;
use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedSensor};
use hcsr04_daq::registry::{AttachRequest, DeviceRegistry};
use hcsr04_daq::slot::{DeviceNumber, PhysicalId};
use hcsr04_daq::{ErrorKind, SonarError};

fn driver(capacity: usize, timeout: Duration) -> SonarDriver {
    SonarDriver::new(
        DeviceRegistry::new(capacity, 240),
        MeasurementEngine::new(timeout),
    )
}

fn request(physical: &str, sensor: &SimulatedSensor) -> AttachRequest {
    let (echo, trigger) = sensor.lines();
    AttachRequest::new(physical)
        .label(physical)
        .echo(echo)
        .trigger(trigger)
}

// =============================================================================
// Pool capacity
// =============================================================================

#[test]
fn test_pool_exhaustion_and_recovery() {
    let driver = driver(3, Duration::from_millis(100));
    let sensors: Vec<_> = (0..4)
        .map(|mm| SimulatedSensor::new(EchoResponse::distance_mm(100 + mm)))
        .collect();

    for (i, sensor) in sensors.iter().take(3).enumerate() {
        let number = driver.attach(request(&format!("s{i}"), sensor)).unwrap();
        assert_eq!(number, DeviceNumber::new(240, i as u32));
    }

    let err = driver.attach(request("s3", &sensors[3])).unwrap_err();
    assert!(matches!(err, SonarError::PoolExhausted { capacity: 3 }));
    assert_eq!(err.errno(), libc::EBUSY);

    let freed = driver.detach(&PhysicalId::from("s1")).unwrap();
    assert_eq!(freed.minor, 1);

    let number = driver.attach(request("s3", &sensors[3])).unwrap();
    assert_eq!(number.minor, 1);
    assert_eq!(driver.open(number).unwrap().read_distance().unwrap(), 103);
}

#[test]
fn test_duplicate_physical_handle_rejected() {
    let driver = driver(3, Duration::from_millis(100));
    let sensor = SimulatedSensor::default();

    driver.attach(request("usb-1", &sensor)).unwrap();
    let err = driver.attach(request("usb-1", &sensor)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyAttached);
    assert_eq!(driver.devices().len(), 1);
}

// =============================================================================
// Open / read / close
// =============================================================================

#[test]
fn test_open_unknown_identity() {
    let driver = driver(2, Duration::from_millis(100));
    assert!(matches!(
        driver.open_minor(0),
        Err(SonarError::NoDevice(_))
    ));
    assert!(matches!(
        driver.detach(&PhysicalId::from("never-attached")),
        Err(SonarError::NoDevice(_))
    ));
}

#[test]
fn test_open_is_not_exclusive() {
    let driver = driver(2, Duration::from_millis(100));
    let sensor = SimulatedSensor::new(EchoResponse::distance_mm(640));
    let number = driver.attach(request("a", &sensor)).unwrap();

    let first = driver.open(number).unwrap();
    let second = driver.open(number).unwrap();
    assert_eq!(first.read_distance().unwrap(), 640);
    assert_eq!(second.read_distance().unwrap(), 640);
    assert_eq!(driver.devices()[0].open_count, 2);

    first.close().unwrap();
    assert_eq!(driver.devices()[0].open_count, 1);
    second.close().unwrap();
    assert_eq!(driver.devices()[0].open_count, 0);
    assert_eq!(driver.devices().len(), 1);
}

#[test]
fn test_stale_handle_after_detach() {
    let driver = driver(1, Duration::from_millis(100));
    let old = SimulatedSensor::new(EchoResponse::distance_mm(100));
    let number = driver.attach(request("old", &old)).unwrap();
    let handle = driver.open(number).unwrap();

    driver.detach(&PhysicalId::from("old")).unwrap();
    assert_eq!(handle.read_distance().unwrap_err().kind(), ErrorKind::NoDevice);

    // Same minor, different sensor: the old handle must not reach it
    let new = SimulatedSensor::new(EchoResponse::distance_mm(200));
    assert_eq!(driver.attach(request("new", &new)).unwrap(), number);
    assert_eq!(handle.read_distance().unwrap_err().kind(), ErrorKind::NoDevice);
    assert!(new.pulses().is_empty());

    assert_eq!(handle.close().unwrap_err().kind(), ErrorKind::NoDevice);
    assert_eq!(driver.open(number).unwrap().read_distance().unwrap(), 200);
}

// =============================================================================
// Attach/detach against in-flight measurements
// =============================================================================

#[test]
fn test_detach_waits_for_in_flight_measurement() {
    let driver = driver(2, Duration::from_millis(300));
    let sensor = SimulatedSensor::new(EchoResponse::Silent);
    let number = driver.attach(request("busy", &sensor)).unwrap();
    let handle = driver.open(number).unwrap();

    let reader = thread::spawn(move || {
        let started = Instant::now();
        let result = handle.read_distance();
        (result, started.elapsed())
    });
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    driver.detach(&PhysicalId::from("busy")).unwrap();
    let detach_took = start.elapsed();

    let (result, read_took) = reader.join().unwrap();
    assert!(result.unwrap_err().is_timeout());
    assert!(read_took >= Duration::from_millis(300));
    assert!(
        detach_took >= Duration::from_millis(150),
        "detach returned after {detach_took:?} while a measurement was in flight"
    );
    assert_eq!(sensor.active_subscriptions(), 0);
}

#[test]
fn test_registry_usable_during_measurement() {
    let driver = driver(3, Duration::from_millis(300));
    let slow = SimulatedSensor::new(EchoResponse::Silent);
    let number = driver.attach(request("slow", &slow)).unwrap();
    let handle = driver.open(number).unwrap();

    let reader = thread::spawn(move || handle.read_distance());
    thread::sleep(Duration::from_millis(30));

    let start = Instant::now();
    let other = SimulatedSensor::new(EchoResponse::distance_mm(500));
    let other_number = driver.attach(request("other", &other)).unwrap();
    assert_eq!(driver.devices().len(), 2);
    assert_eq!(driver.open(other_number).unwrap().read_distance().unwrap(), 500);
    driver.detach(&PhysicalId::from("other")).unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));

    assert!(reader.join().unwrap().is_err());
}

#[test]
fn test_registry_usable_while_detach_waits() {
    let driver = driver(3, Duration::from_millis(400));
    let busy = SimulatedSensor::new(EchoResponse::Silent);
    let busy_number = driver.attach(request("busy", &busy)).unwrap();
    let other = SimulatedSensor::new(EchoResponse::distance_mm(700));
    let other_number = driver.attach(request("other", &other)).unwrap();

    let handle = driver.open(busy_number).unwrap();
    let reader = thread::spawn(move || handle.read_distance());
    thread::sleep(Duration::from_millis(30));

    let detacher = {
        let driver = driver.clone();
        thread::spawn(move || driver.detach(&PhysicalId::from("busy")))
    };
    thread::sleep(Duration::from_millis(30));

    // The detach is parked on the busy slot; nothing else waits for it
    let start = Instant::now();
    let other_handle = driver.open(other_number).unwrap();
    assert_eq!(driver.devices().len(), 1);
    assert!(matches!(
        driver.open(busy_number),
        Err(SonarError::NoDevice(_))
    ));
    assert!(driver
        .registry()
        .find_by_physical_handle(&PhysicalId::from("busy"))
        .is_err());
    let took = start.elapsed();
    assert!(took < Duration::from_millis(100), "open waited {took:?} behind detach");
    assert_eq!(other_handle.read_distance().unwrap(), 700);

    assert_eq!(detacher.join().unwrap().unwrap(), busy_number);
    assert!(reader.join().unwrap().unwrap_err().is_timeout());
    assert_eq!(driver.registry().occupied(), 1);
    assert_eq!(busy.active_subscriptions(), 0);
}
