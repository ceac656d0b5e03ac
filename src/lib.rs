//! # HC-SR04 Driver Core
//!
//! Driver core for HC-SR04 class ultrasonic ranging sensors. A measurement
//! pulses the sensor's trigger line, timestamps the rising and falling edges
//! of its echo line, and converts the echo high time into millimeters.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the pin I/O capability (`TriggerLine`, `EchoLine`, edge
//!   subscriptions) with a simulated backend and a Raspberry Pi backend.
//! - **`capture`**: the asynchronous edge handler and the completion signal
//!   a measurement waits on.
//! - **`slot`**: one logical sensor's bound state and lock.
//! - **`registry`**: the fixed-capacity pool of slots with attach, detach and
//!   identity lookup.
//! - **`engine`**: the trigger/capture/validate cycle.
//! - **`driver`**: open/read/close facade over registry and engine.
//! - **`hal`**: async capability wrapper for tokio callers.
//! - **`config`** / **`tracing_setup`**: Figment configuration and tracing
//!   initialization.
//! - **`error`**: `SonarError` and its error kinds.
//!
//! ## Example
//!
//! ```rust
//! use hcsr04_daq::driver::SonarDriver;
//! use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedSensor};
//! use hcsr04_daq::registry::AttachRequest;
//!
//! let driver = SonarDriver::default();
//! let sensor = SimulatedSensor::new(EchoResponse::distance_mm(420));
//! let (echo, trigger) = sensor.lines();
//! let number = driver
//!     .attach(AttachRequest::new("usb-1").label("left").echo(echo).trigger(trigger))
//!     .unwrap();
//!
//! let handle = driver.open(number).unwrap();
//! assert_eq!(handle.read_distance().unwrap(), 420);
//! ```

pub mod capture;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hal;
pub mod hardware;
pub mod registry;
pub mod slot;
pub mod tracing_setup;

pub use driver::{DeviceHandle, SonarDriver};
pub use error::{ErrorKind, Result, SonarError};
