//! One logical sensor's state.
//!
//! A [`DeviceSlot`] is pre-allocated for the process lifetime. Its mutex
//! guards the [`Binding`] (label and the two pins) and serializes
//! measurements against each other and against attach/detach. The
//! [`EdgeCapture`] sits outside the mutex so the echo handler can reach it
//! without blocking on a measurement that is waiting for it.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::capture::EdgeCapture;
use crate::hardware::{EchoLine, TriggerLine};

/// Logical address of an attached sensor. `minor` is the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceNumber {
    /// Driver-wide major number.
    pub major: u32,
    /// Slot index.
    pub minor: u32,
}

impl DeviceNumber {
    /// Device number `major:minor`.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Device node name, `hcsr04-<minor>`.
    pub fn node_name(&self) -> String {
        format!("hcsr04-{}", self.minor)
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Key the attach/detach source uses to correlate events for one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalId(String);

impl PhysicalId {
    /// Wrap a physical handle.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Handle as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PhysicalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PhysicalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a bound slot owns.
pub struct Binding {
    /// Logical identity.
    pub identity: DeviceNumber,
    /// Attach correlation key.
    pub physical: PhysicalId,
    /// Human-readable label.
    pub label: String,
    /// Bumped on every attach; handles opened against an older binding are stale.
    pub(crate) generation: u64,
    pub(crate) echo: Box<dyn EchoLine>,
    pub(crate) trigger: Box<dyn TriggerLine>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("identity", &self.identity)
            .field("physical", &self.physical)
            .field("label", &self.label)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Pool entry for one sensor.
pub struct DeviceSlot {
    index: usize,
    binding: Mutex<Option<Binding>>,
    capture: Arc<EdgeCapture>,
}

impl DeviceSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            binding: Mutex::new(None),
            capture: Arc::new(EdgeCapture::new(index)),
        }
    }

    /// Position in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Echo capture state shared with the edge handler.
    pub fn capture(&self) -> &Arc<EdgeCapture> {
        &self.capture
    }

    /// Take the slot lock. Blocks while a measurement is in flight.
    pub fn lock(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock()
    }

    /// Whether the slot currently holds a binding.
    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_number_naming() {
        let number = DeviceNumber::new(240, 3);
        assert_eq!(number.to_string(), "240:3");
        assert_eq!(number.node_name(), "hcsr04-3");
    }

    #[test]
    fn test_new_slot_is_free() {
        let slot = DeviceSlot::new(4);
        assert_eq!(slot.index(), 4);
        assert!(!slot.is_bound());
        assert!(slot.capture().snapshot().is_clear());
    }
}
