//! Raspberry Pi GPIO backend (feature `rpi`).
//!
//! Trigger is a plain `rppal` output pin. Echo edges come from `rppal`'s
//! asynchronous interrupt thread, whose event timestamps are used as the
//! capture timestamps.

use std::sync::Arc;

use parking_lot::Mutex;
use rppal::gpio::{Event, Gpio, InputPin, OutputPin, Trigger};
use tracing::{debug, warn};

use crate::hardware::{
    EchoLine, Edge, EdgeEvent, EdgeHandler, EdgeSubscription, Level, LineProvider, LinePair,
    PinError, TriggerLine,
};

impl From<rppal::gpio::Error> for PinError {
    fn from(err: rppal::gpio::Error) -> Self {
        PinError::Backend(err.to_string())
    }
}

/// BCM-numbered output pin driving the sensor's TRIG input.
pub struct RpiTriggerLine {
    pin: OutputPin,
}

impl TriggerLine for RpiTriggerLine {
    fn set_level(&mut self, level: Level) -> Result<(), PinError> {
        match level {
            Level::High => self.pin.set_high(),
            Level::Low => self.pin.set_low(),
        }
        Ok(())
    }
}

/// BCM-numbered input pin reading the sensor's ECHO output.
pub struct RpiEchoLine {
    pin: Arc<Mutex<InputPin>>,
}

impl EchoLine for RpiEchoLine {
    fn level(&self) -> Result<Level, PinError> {
        Ok(if self.pin.lock().is_high() {
            Level::High
        } else {
            Level::Low
        })
    }

    fn subscribe(&mut self, handler: EdgeHandler) -> Result<EdgeSubscription, PinError> {
        self.pin
            .lock()
            .set_async_interrupt(Trigger::Both, None, move |event: Event| {
                let edge = match event.trigger {
                    Trigger::RisingEdge => Edge::Rising,
                    Trigger::FallingEdge => Edge::Falling,
                    _ => return,
                };
                let timestamp_ns = i64::try_from(event.timestamp.as_nanos()).unwrap_or(i64::MAX);
                handler(EdgeEvent { edge, timestamp_ns });
            })?;

        let pin = Arc::clone(&self.pin);
        Ok(EdgeSubscription::new(move || {
            if let Err(e) = pin.lock().clear_async_interrupt() {
                warn!(error = %e, "Failed to clear echo interrupt");
            }
        }))
    }
}

/// [`LineProvider`] over the Pi's GPIO header.
#[derive(Debug, Default)]
pub struct RpiLines;

impl LineProvider for RpiLines {
    fn open(&mut self, echo_gpio: u8, trigger_gpio: u8) -> Result<LinePair, PinError> {
        let (echo, trigger) = open_lines(echo_gpio, trigger_gpio)?;
        Ok((Box::new(echo), Box::new(trigger)))
    }
}

/// Claim the echo and trigger pins. The trigger starts low.
pub fn open_lines(echo_gpio: u8, trigger_gpio: u8) -> Result<(RpiEchoLine, RpiTriggerLine), PinError> {
    let gpio = Gpio::new()?;

    let echo = gpio
        .get(echo_gpio)
        .map_err(|e| PinError::Unavailable {
            pin: echo_gpio,
            message: e.to_string(),
        })?
        .into_input();
    let trigger = gpio
        .get(trigger_gpio)
        .map_err(|e| PinError::Unavailable {
            pin: trigger_gpio,
            message: e.to_string(),
        })?
        .into_output_low();

    debug!(echo_gpio, trigger_gpio, "Claimed GPIO lines");

    Ok((
        RpiEchoLine {
            pin: Arc::new(Mutex::new(echo)),
        },
        RpiTriggerLine { pin: trigger },
    ))
}
