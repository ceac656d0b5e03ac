//! Fixed-capacity device registry.
//!
//! The registry owns `capacity` pre-allocated [`DeviceSlot`]s, indexed
//! `0..capacity`, plus one bookkeeping table behind a registry-wide mutex.
//! The table records occupancy and the two independent lookup keys:
//!
//! - logical identity ([`DeviceNumber`]), used by open/read/close
//! - physical handle ([`PhysicalId`]), used by detach
//!
//! # Locking
//!
//! Every table mutation happens under the registry lock. Attach takes the
//! slot lock second, on a slot no measurement is bound to. Detach never holds
//! both: it marks the entry as detaching, releases the registry lock, waits
//! for the slot lock and then re-takes the registry lock to free the entry.
//! The measurement engine only ever takes slot locks, so lookups and
//! attach/detach of other slots proceed while a measurement is in flight.
//!
//! # Example
//!
//! ```rust
//! use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedSensor};
//! use hcsr04_daq::registry::{AttachRequest, DeviceRegistry};
//!
//! let registry = DeviceRegistry::new(4, 240);
//! let sensor = SimulatedSensor::new(EchoResponse::distance_mm(120));
//! let (echo, trigger) = sensor.lines();
//!
//! let number = registry
//!     .attach(
//!         AttachRequest::new("front")
//!             .label("bumper")
//!             .echo(echo)
//!             .trigger(trigger),
//!     )
//!     .unwrap();
//! assert_eq!(number.minor, 0);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SonarError};
use crate::hardware::{EchoLine, Level, TriggerLine};
use crate::slot::{Binding, DeviceNumber, DeviceSlot, PhysicalId};

/// Default pool size.
pub const DEFAULT_CAPACITY: usize = 10;

/// Default major device number.
pub const DEFAULT_MAJOR: u32 = 240;

#[derive(Debug, Default, Clone)]
struct SlotEntry {
    occupied: bool,
    detaching: bool,
    identity: Option<DeviceNumber>,
    physical: Option<PhysicalId>,
    label: String,
    generation: u64,
    open_count: usize,
}

impl SlotEntry {
    fn clear(&mut self) {
        *self = Self::default();
    }

    /// Bound and not on its way out.
    fn is_live(&self) -> bool {
        self.occupied && !self.detaching
    }
}

struct Table {
    entries: Vec<SlotEntry>,
    next_generation: u64,
}

impl Table {
    fn first_free(&self) -> Option<usize> {
        self.entries.iter().position(|entry| !entry.occupied)
    }

    fn index_of_identity(&self, identity: DeviceNumber) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_live() && entry.identity == Some(identity))
    }

    fn index_of_physical(&self, physical: &PhysicalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_live() && entry.physical.as_ref() == Some(physical))
    }
}

/// Properties delivered with an attach event.
///
/// Everything except the physical handle is optional so that an incomplete
/// attach source can be represented and rejected.
pub struct AttachRequest {
    physical: PhysicalId,
    label: Option<String>,
    echo: Option<Box<dyn EchoLine>>,
    trigger: Option<Box<dyn TriggerLine>>,
}

impl AttachRequest {
    /// Attach request for `physical` with no properties set.
    pub fn new(physical: impl Into<PhysicalId>) -> Self {
        Self {
            physical: physical.into(),
            label: None,
            echo: None,
            trigger: None,
        }
    }

    /// Set the label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the echo line.
    pub fn echo(mut self, echo: impl EchoLine + 'static) -> Self {
        self.echo = Some(Box::new(echo));
        self
    }

    /// Set the trigger line.
    pub fn trigger(mut self, trigger: impl TriggerLine + 'static) -> Self {
        self.trigger = Some(Box::new(trigger));
        self
    }

    /// Set an already boxed echo line.
    pub fn echo_boxed(mut self, echo: Box<dyn EchoLine>) -> Self {
        self.echo = Some(echo);
        self
    }

    /// Set an already boxed trigger line.
    pub fn trigger_boxed(mut self, trigger: Box<dyn TriggerLine>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Physical handle of this request.
    pub fn physical(&self) -> &PhysicalId {
        &self.physical
    }
}

/// Registry view of one attached sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Logical identity.
    pub identity: DeviceNumber,
    /// Device node name.
    pub node: String,
    /// Physical handle.
    pub physical: PhysicalId,
    /// Label.
    pub label: String,
    /// Handles currently open.
    pub open_count: usize,
}

/// Record of one successful open, needed to close it again.
#[derive(Debug, Clone)]
pub struct OpenSlot {
    /// Opened slot.
    pub slot: Arc<DeviceSlot>,
    /// Identity the caller opened.
    pub identity: DeviceNumber,
    pub(crate) generation: u64,
}

/// Fixed pool of device slots.
pub struct DeviceRegistry {
    major: u32,
    slots: Vec<Arc<DeviceSlot>>,
    table: Mutex<Table>,
}

impl DeviceRegistry {
    /// Registry with `capacity` free slots under major number `major`.
    pub fn new(capacity: usize, major: u32) -> Self {
        Self {
            major,
            slots: (0..capacity).map(|i| Arc::new(DeviceSlot::new(i))).collect(),
            table: Mutex::new(Table {
                entries: vec![SlotEntry::default(); capacity],
                next_generation: 1,
            }),
        }
    }

    /// Pool size.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Major device number.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Number of bound slots.
    pub fn occupied(&self) -> usize {
        self.table.lock().entries.iter().filter(|e| e.occupied).count()
    }

    /// First free slot. The slot is not reserved.
    pub fn allocate_slot(&self) -> Result<Arc<DeviceSlot>> {
        let table = self.table.lock();
        table
            .first_free()
            .map(|index| Arc::clone(&self.slots[index]))
            .ok_or(SonarError::PoolExhausted {
                capacity: self.capacity(),
            })
    }

    /// Occupied slot with logical identity `identity`.
    pub fn find_by_identity(&self, identity: DeviceNumber) -> Result<Arc<DeviceSlot>> {
        let table = self.table.lock();
        table
            .index_of_identity(identity)
            .map(|index| Arc::clone(&self.slots[index]))
            .ok_or_else(|| SonarError::NoDevice(identity.to_string()))
    }

    /// Occupied slot attached under `physical`.
    pub fn find_by_physical_handle(&self, physical: &PhysicalId) -> Result<Arc<DeviceSlot>> {
        let table = self.table.lock();
        table
            .index_of_physical(physical)
            .map(|index| Arc::clone(&self.slots[index]))
            .ok_or_else(|| SonarError::NoDevice(physical.to_string()))
    }

    /// Bind a sensor to the first free slot.
    ///
    /// Fails without touching any slot if the handle is already attached, the
    /// pool is full, a property is missing, or the trigger cannot be driven
    /// low.
    #[instrument(skip_all, fields(physical = %request.physical))]
    pub fn attach(&self, request: AttachRequest) -> Result<DeviceNumber> {
        let mut table = self.table.lock();

        if table.index_of_physical(&request.physical).is_some() {
            warn!("Duplicate attach rejected");
            return Err(SonarError::AlreadyAttached(request.physical.to_string()));
        }

        let index = table.first_free().ok_or_else(|| {
            warn!(capacity = self.capacity(), "No free slot for attach");
            SonarError::PoolExhausted {
                capacity: self.capacity(),
            }
        })?;

        let AttachRequest {
            physical,
            label,
            echo,
            trigger,
        } = request;
        let label = label.ok_or(SonarError::MissingProperty("label"))?;
        let echo = echo.ok_or(SonarError::MissingProperty("echo"))?;
        let mut trigger = trigger.ok_or(SonarError::MissingProperty("trigger"))?;

        trigger
            .set_level(Level::Low)
            .map_err(|e| SonarError::io("trigger low at attach", e))?;

        let identity = DeviceNumber::new(self.major, index as u32);
        let generation = table.next_generation;
        table.next_generation += 1;

        *self.slots[index].lock() = Some(Binding {
            identity,
            physical: physical.clone(),
            label: label.clone(),
            generation,
            echo,
            trigger,
        });

        table.entries[index] = SlotEntry {
            occupied: true,
            detaching: false,
            identity: Some(identity),
            physical: Some(physical),
            label: label.clone(),
            generation,
            open_count: 0,
        };

        info!(%identity, %label, slot = index, "Sensor attached");
        Ok(identity)
    }

    /// Unbind the slot attached under `physical` and release its pins.
    ///
    /// Waits for an in-flight measurement on that slot to finish. While it
    /// waits the sensor is already invisible to lookups and `open`, and the
    /// rest of the registry stays usable.
    #[instrument(skip_all, fields(physical = %physical))]
    pub fn detach(&self, physical: &PhysicalId) -> Result<DeviceNumber> {
        let (index, identity) = {
            let mut table = self.table.lock();
            let index = table
                .index_of_physical(physical)
                .ok_or_else(|| SonarError::NoDevice(physical.to_string()))?;
            let entry = &mut table.entries[index];
            entry.detaching = true;
            if entry.open_count > 0 {
                debug!(open_count = entry.open_count, "Detaching sensor with open handles");
            }
            let identity = entry
                .identity
                .unwrap_or_else(|| DeviceNumber::new(self.major, index as u32));
            (index, identity)
        };

        let binding = self.slots[index].lock().take();
        self.table.lock().entries[index].clear();
        drop(binding);

        info!(%identity, slot = index, "Sensor detached");
        Ok(identity)
    }

    /// Record an open of `identity`.
    pub fn open(&self, identity: DeviceNumber) -> Result<OpenSlot> {
        let mut table = self.table.lock();
        let index = table
            .index_of_identity(identity)
            .ok_or_else(|| SonarError::NoDevice(identity.to_string()))?;
        let entry = &mut table.entries[index];
        entry.open_count += 1;
        debug!(%identity, open_count = entry.open_count, "Device opened");
        Ok(OpenSlot {
            slot: Arc::clone(&self.slots[index]),
            identity,
            generation: entry.generation,
        })
    }

    /// Drop the association recorded by [`open`](Self::open).
    ///
    /// `NoDevice` if the sensor was detached in the meantime.
    pub fn close(&self, open: &OpenSlot) -> Result<()> {
        let mut table = self.table.lock();
        let entry = &mut table.entries[open.slot.index()];
        if !entry.occupied || entry.generation != open.generation {
            return Err(SonarError::NoDevice(open.identity.to_string()));
        }
        entry.open_count = entry.open_count.saturating_sub(1);
        debug!(identity = %open.identity, open_count = entry.open_count, "Device closed");
        Ok(())
    }

    /// Attached sensors in slot order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let table = self.table.lock();
        table
            .entries
            .iter()
            .filter(|entry| entry.is_live())
            .filter_map(|entry| {
                let identity = entry.identity?;
                Some(DeviceInfo {
                    identity,
                    node: identity.node_name(),
                    physical: entry.physical.clone()?,
                    label: entry.label.clone(),
                    open_count: entry.open_count,
                })
            })
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAJOR)
    }
}
