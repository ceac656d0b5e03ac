//! Async capability over a blocking [`DeviceHandle`].
//!
//! Measurements block for up to the echo deadline, so the async wrapper
//! runs them on tokio's blocking pool. If the calling future is dropped the
//! measurement is interrupted and unwinds like a timeout.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::driver::DeviceHandle;
use crate::engine::Interrupt;

/// Capability: produce one distance reading.
///
/// # Example
///
/// ```rust
/// use hcsr04_daq::driver::SonarDriver;
/// use hcsr04_daq::hal::{AsyncDistanceSensor, DistanceReadable};
/// use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedSensor};
/// use hcsr04_daq::registry::AttachRequest;
///
/// let driver = SonarDriver::default();
/// let sensor = SimulatedSensor::new(EchoResponse::distance_mm(250));
/// let (echo, trigger) = sensor.lines();
/// let number = driver
///     .attach(AttachRequest::new("front").label("front").echo(echo).trigger(trigger))
///     .unwrap();
///
/// let async_sensor = AsyncDistanceSensor::new(driver.open(number).unwrap());
/// let mm = tokio_test::block_on(async_sensor.read_distance_mm()).unwrap();
/// assert_eq!(mm, 250);
/// ```
#[async_trait]
pub trait DistanceReadable: Send + Sync {
    /// Measure once and return millimeters.
    async fn read_distance_mm(&self) -> Result<u16>;
}

/// [`DistanceReadable`] for an open sensor.
#[derive(Clone, Debug)]
pub struct AsyncDistanceSensor {
    handle: Arc<DeviceHandle>,
}

impl AsyncDistanceSensor {
    /// Wrap an open handle.
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// The wrapped handle.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }
}

/// Raises the interrupt unless disarmed first.
struct RaiseOnDrop {
    interrupt: Option<Interrupt>,
}

impl RaiseOnDrop {
    fn disarm(mut self) {
        self.interrupt = None;
    }
}

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        if let Some(interrupt) = self.interrupt.take() {
            interrupt.raise();
        }
    }
}

#[async_trait]
impl DistanceReadable for AsyncDistanceSensor {
    async fn read_distance_mm(&self) -> Result<u16> {
        let interrupt = Interrupt::new();
        let cancel = RaiseOnDrop {
            interrupt: Some(interrupt.clone()),
        };

        let handle = Arc::clone(&self.handle);
        let reading = tokio::task::spawn_blocking(move || handle.read_distance_with(&interrupt))
            .await
            .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
        cancel.disarm();

        let identity = self
            .handle
            .identity()
            .map_or_else(|| "closed".to_string(), |id| id.to_string());
        reading.with_context(|| format!("Distance read on {identity} failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SonarDriver;
    use crate::error::SonarError;
    use crate::hardware::mock::{EchoResponse, SimulatedSensor};
    use crate::registry::AttachRequest;
    use std::time::Duration;

    fn sensor_with(response: EchoResponse) -> (SimulatedSensor, AsyncDistanceSensor) {
        let driver = SonarDriver::new(
            crate::registry::DeviceRegistry::new(2, 240),
            crate::engine::MeasurementEngine::new(Duration::from_secs(2)),
        );
        let sensor = SimulatedSensor::new(response);
        let (echo, trigger) = sensor.lines();
        let number = driver
            .attach(AttachRequest::new("a").label("a").echo(echo).trigger(trigger))
            .unwrap();
        let handle = driver.open(number).unwrap();
        (sensor, AsyncDistanceSensor::new(handle))
    }

    #[tokio::test]
    async fn test_async_read() {
        let (_sensor, async_sensor) = sensor_with(EchoResponse::distance_mm(1234));
        assert_eq!(async_sensor.read_distance_mm().await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn test_async_error_keeps_kind() {
        let (_sensor, async_sensor) = sensor_with(EchoResponse::distance_mm(3));
        let err = async_sensor.read_distance_mm().await.unwrap_err();
        let sonar = err.downcast_ref::<SonarError>().unwrap();
        assert!(matches!(sonar, SonarError::OutOfRange { distance_mm: 3 }));
    }

    #[tokio::test]
    async fn test_dropped_future_interrupts_measurement() {
        let (sensor, async_sensor) = sensor_with(EchoResponse::Silent);

        // 2 s deadline; the select drops the read after 20 ms
        let started = std::time::Instant::now();
        tokio::select! {
            _ = async_sensor.read_distance_mm() => panic!("silent sensor produced a reading"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        // Slot lock is released once the interrupted wait unwinds
        sensor.set_response(EchoResponse::distance_mm(100));
        let mm = async_sensor.read_distance_mm().await.unwrap();
        assert_eq!(mm, 100);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sensor.active_subscriptions(), 0);
    }
}
