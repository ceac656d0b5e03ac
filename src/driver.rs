//! Driver facade: registry plus engine behind open/read/close.
//!
//! [`SonarDriver`] is what an attach/detach source and a device-node layer
//! talk to. [`DeviceHandle`] is one open of one sensor; reads on it run a
//! full measurement cycle.
//!
//! # Example
//!
//! ```rust
//! use hcsr04_daq::driver::SonarDriver;
//! use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedSensor};
//! use hcsr04_daq::registry::AttachRequest;
//!
//! let driver = SonarDriver::default();
//! let sensor = SimulatedSensor::new(EchoResponse::distance_mm(120));
//! let (echo, trigger) = sensor.lines();
//! let number = driver
//!     .attach(AttachRequest::new("front").label("front").echo(echo).trigger(trigger))
//!     .unwrap();
//!
//! let handle = driver.open(number).unwrap();
//! let mut buf = [0u8; 2];
//! assert_eq!(handle.read(&mut buf).unwrap(), 2);
//! assert_eq!(buf, [0x00, 0x78]);
//! handle.close().unwrap();
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{DeviceConfig, SonarConfig};
use crate::engine::{decode_distance, Interrupt, MeasurementEngine, RESULT_LEN};
use crate::error::{Result, SonarError};
use crate::hardware::LineProvider;
use crate::registry::{AttachRequest, DeviceInfo, DeviceRegistry, OpenSlot};
use crate::slot::{DeviceNumber, PhysicalId};

/// Owns the device registry and the measurement engine.
#[derive(Clone)]
pub struct SonarDriver {
    registry: Arc<DeviceRegistry>,
    engine: Arc<MeasurementEngine>,
}

impl SonarDriver {
    /// Driver over `registry` using `engine` for every read.
    pub fn new(registry: DeviceRegistry, engine: MeasurementEngine) -> Self {
        Self {
            registry: Arc::new(registry),
            engine: Arc::new(engine),
        }
    }

    /// Driver sized and timed from `config`. No sensors are attached.
    pub fn from_config(config: &SonarConfig) -> Result<Self> {
        let engine = MeasurementEngine::new(config.measurement.timeout())
            .with_pulse_width(config.measurement.pulse_width())?;
        let registry = DeviceRegistry::new(config.registry.capacity, config.registry.major);
        Ok(Self::new(registry, engine))
    }

    /// The device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The measurement engine.
    pub fn engine(&self) -> &MeasurementEngine {
        &self.engine
    }

    /// Bind a sensor. See [`DeviceRegistry::attach`].
    pub fn attach(&self, request: AttachRequest) -> Result<DeviceNumber> {
        self.registry.attach(request)
    }

    /// Unbind a sensor. See [`DeviceRegistry::detach`].
    pub fn detach(&self, physical: &PhysicalId) -> Result<DeviceNumber> {
        self.registry.detach(physical)
    }

    /// Attach one configured sensor, claiming its pins from `lines`.
    ///
    /// Missing pins or label surface as [`SonarError::MissingProperty`].
    pub fn attach_device(
        &self,
        device: &DeviceConfig,
        lines: &mut dyn LineProvider,
    ) -> Result<DeviceNumber> {
        let label = device
            .label
            .as_ref()
            .ok_or(SonarError::MissingProperty("label"))?;
        let mut request = AttachRequest::new(device.node.as_str()).label(label.clone());
        if let (Some(echo_gpio), Some(trigger_gpio)) = (device.echo_gpio, device.trigger_gpio) {
            let (echo, trigger) = lines
                .open(echo_gpio, trigger_gpio)
                .map_err(|e| SonarError::io("claim pins", e))?;
            request = request.echo_boxed(echo).trigger_boxed(trigger);
        } else if device.echo_gpio.is_none() {
            return Err(SonarError::MissingProperty("echo"));
        } else {
            return Err(SonarError::MissingProperty("trigger"));
        }
        self.registry.attach(request)
    }

    /// Attach every enabled sensor in `config`.
    ///
    /// A failing sensor is logged and reported; it does not stop the others.
    pub fn attach_configured(
        &self,
        config: &SonarConfig,
        lines: &mut dyn LineProvider,
    ) -> Vec<(String, Result<DeviceNumber>)> {
        config
            .enabled_devices()
            .into_iter()
            .map(|device| {
                let result = self.attach_device(device, lines);
                if let Err(e) = &result {
                    warn!(node = %device.node, error = %e, "Configured sensor not attached");
                }
                (device.node.clone(), result)
            })
            .collect()
    }

    /// Open `identity` for reading.
    pub fn open(&self, identity: DeviceNumber) -> Result<DeviceHandle> {
        let open = self.registry.open(identity)?;
        Ok(DeviceHandle {
            registry: Arc::clone(&self.registry),
            engine: Arc::clone(&self.engine),
            open: Some(open),
        })
    }

    /// Open the sensor in slot `minor` under this driver's major number.
    pub fn open_minor(&self, minor: u32) -> Result<DeviceHandle> {
        self.open(DeviceNumber::new(self.registry.major(), minor))
    }

    /// Attached sensors in slot order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.devices()
    }
}

impl Default for SonarDriver {
    fn default() -> Self {
        Self::new(DeviceRegistry::default(), MeasurementEngine::default())
    }
}

/// One open of one sensor. Dropping it closes it.
pub struct DeviceHandle {
    registry: Arc<DeviceRegistry>,
    engine: Arc<MeasurementEngine>,
    open: Option<OpenSlot>,
}

impl DeviceHandle {
    fn open_slot(&self) -> Result<&OpenSlot> {
        self.open
            .as_ref()
            .ok_or_else(|| SonarError::NoDevice("handle closed".to_string()))
    }

    /// Identity this handle was opened on.
    pub fn identity(&self) -> Option<DeviceNumber> {
        self.open.as_ref().map(|open| open.identity)
    }

    /// Measure once and write the 2-byte big-endian distance into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(buf, None)
    }

    /// [`read`](Self::read), cancellable through `interrupt`.
    pub fn read_with_interrupt(&self, buf: &mut [u8], interrupt: &Interrupt) -> Result<usize> {
        self.read_inner(buf, Some(interrupt))
    }

    /// Measure once and return millimeters.
    pub fn read_distance(&self) -> Result<u16> {
        let mut buf = [0u8; RESULT_LEN];
        self.read(&mut buf)?;
        Ok(decode_distance(buf))
    }

    /// [`read_distance`](Self::read_distance), cancellable through `interrupt`.
    pub fn read_distance_with(&self, interrupt: &Interrupt) -> Result<u16> {
        let mut buf = [0u8; RESULT_LEN];
        self.read_with_interrupt(&mut buf, interrupt)?;
        Ok(decode_distance(buf))
    }

    fn read_inner(&self, buf: &mut [u8], interrupt: Option<&Interrupt>) -> Result<usize> {
        let open = self.open_slot()?;
        self.engine
            .measure_bound(&open.slot, Some(open.generation), Some(buf), interrupt)
    }

    /// Close the handle. `NoDevice` if the sensor was detached meanwhile.
    pub fn close(mut self) -> Result<()> {
        match self.open.take() {
            Some(open) => self.registry.close(&open),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(open) = self.open.take() {
            if self.registry.close(&open).is_err() {
                info!(identity = %open.identity, "Handle dropped after detach");
            }
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{EchoResponse, SimulatedLines};

    fn device(node: &str, echo: Option<u8>, trigger: Option<u8>) -> DeviceConfig {
        DeviceConfig {
            node: node.to_string(),
            label: Some(node.to_string()),
            echo_gpio: echo,
            trigger_gpio: trigger,
            enabled: true,
        }
    }

    #[test]
    fn test_attach_configured_reports_each_device() {
        let config = SonarConfig {
            devices: vec![
                device("front", Some(24), Some(23)),
                device("rear", None, Some(17)),
                device("left", Some(5), Some(6)),
            ],
            ..Default::default()
        };
        let driver = SonarDriver::from_config(&config).unwrap();
        let mut lines = SimulatedLines::new(EchoResponse::distance_mm(300));

        let results = driver.attach_configured(&config, &mut lines);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1.as_ref().unwrap().minor, 0);
        assert!(matches!(
            results[1].1,
            Err(SonarError::MissingProperty("echo"))
        ));
        assert_eq!(results[2].1.as_ref().unwrap().minor, 1);
        assert!(lines.sensor(24).is_some());
    }

    #[test]
    fn test_missing_label_checked_before_pins_are_claimed() {
        let driver = SonarDriver::default();
        let mut lines = SimulatedLines::new(EchoResponse::distance_mm(300));

        let mut unlabeled = device("front", None, None);
        unlabeled.label = None;
        assert!(matches!(
            driver.attach_device(&unlabeled, &mut lines),
            Err(SonarError::MissingProperty("label"))
        ));

        unlabeled.echo_gpio = Some(24);
        unlabeled.trigger_gpio = Some(23);
        assert!(matches!(
            driver.attach_device(&unlabeled, &mut lines),
            Err(SonarError::MissingProperty("label"))
        ));
        assert!(lines.sensor(24).is_none());

        // Pins were never claimed, so the corrected device attaches
        let number = driver
            .attach_device(&device("front", Some(24), Some(23)), &mut lines)
            .unwrap();
        assert_eq!(number.minor, 0);
    }

    #[test]
    fn test_handle_drop_closes() {
        let config = SonarConfig {
            devices: vec![device("front", Some(24), Some(23))],
            ..Default::default()
        };
        let driver = SonarDriver::from_config(&config).unwrap();
        let mut lines = SimulatedLines::new(EchoResponse::distance_mm(300));
        driver.attach_configured(&config, &mut lines);

        {
            let _a = driver.open_minor(0).unwrap();
            let _b = driver.open_minor(0).unwrap();
            assert_eq!(driver.devices()[0].open_count, 2);
        }
        assert_eq!(driver.devices()[0].open_count, 0);
    }
}
