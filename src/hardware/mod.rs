//! Pulse/edge I/O capability.
//!
//! The measurement engine never touches GPIO directly. It drives a
//! [`TriggerLine`] and subscribes to an [`EchoLine`], both supplied by whoever
//! attaches the sensor. Backends:
//!
//! - [`mock`] - simulated sensor for tests and the CLI without hardware
//! - `rpi` - Raspberry Pi GPIO via `rppal` (feature `rpi`)
//!
//! # Edge delivery
//!
//! An [`EchoLine`] calls the registered [`EdgeHandler`] from its own context
//! (interrupt thread, poll thread, test thread) with an [`EdgeEvent`] carrying
//! a monotonic nanosecond timestamp. The handler must be cheap and must not
//! block.
//!
//! # Subscription lifetime
//!
//! [`EchoLine::subscribe`] returns an [`EdgeSubscription`]. Dropping it
//! unsubscribes; after the drop returns, the backend must not invoke the
//! handler again.

pub mod clock;
pub mod mock;
#[cfg(feature = "rpi")]
pub mod rpi;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by pin backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    /// Line already has an edge subscriber.
    #[error("Edge notification already requested on this line")]
    AlreadySubscribed,

    /// Pin could not be acquired or configured.
    #[error("Pin {pin} unavailable: {message}")]
    Unavailable {
        /// Backend pin number.
        pin: u8,
        /// Backend message.
        message: String,
    },

    /// Backend reported an error.
    #[error("{0}")]
    Backend(String),
}

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    /// Driven or read low.
    #[default]
    Low,
    /// Driven or read high.
    High,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Direction of a transition on a monitored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Low to high.
    Rising,
    /// High to low.
    Falling,
}

/// One edge notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Transition direction.
    pub edge: Edge,
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: i64,
}

impl EdgeEvent {
    /// Rising edge at `timestamp_ns`.
    pub fn rising(timestamp_ns: i64) -> Self {
        Self {
            edge: Edge::Rising,
            timestamp_ns,
        }
    }

    /// Falling edge at `timestamp_ns`.
    pub fn falling(timestamp_ns: i64) -> Self {
        Self {
            edge: Edge::Falling,
            timestamp_ns,
        }
    }
}

/// Callback invoked by an [`EchoLine`] for each edge.
pub type EdgeHandler = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

/// Output line that starts a measurement cycle.
pub trait TriggerLine: Send {
    /// Drive the line to `level`.
    fn set_level(&mut self, level: Level) -> Result<(), PinError>;
}

/// Input line carrying the echo pulse.
pub trait EchoLine: Send {
    /// Current level of the line.
    fn level(&self) -> Result<Level, PinError>;

    /// Request notification of rising and falling edges.
    ///
    /// At most one subscription may be active per line.
    fn subscribe(&mut self, handler: EdgeHandler) -> Result<EdgeSubscription, PinError>;
}

/// Echo and trigger line pair for one sensor.
pub type LinePair = (Box<dyn EchoLine>, Box<dyn TriggerLine>);

/// Opens line pairs for sensors defined by pin number.
pub trait LineProvider {
    /// Claim the echo and trigger pins of one sensor.
    fn open(&mut self, echo_gpio: u8, trigger_gpio: u8) -> Result<LinePair, PinError>;
}

/// Active edge subscription. Dropping it unsubscribes.
#[must_use = "dropping the subscription immediately unsubscribes"]
pub struct EdgeSubscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl EdgeSubscription {
    /// Subscription that runs `release` when dropped.
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for EdgeSubscription {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for EdgeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeSubscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let sub = EdgeSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&released);
        {
            let _sub = EdgeSubscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_level_display() {
        assert_eq!(Level::High.to_string(), "high");
        assert_eq!(Level::default(), Level::Low);
    }
}
