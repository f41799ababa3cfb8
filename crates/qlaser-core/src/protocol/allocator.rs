//! Pulse definition slot allocation
//!
//! Writing a definition needs a slot index. A [`SlotAllocator`] picks one,
//! either by scanning the instrument for an empty slot or by taking an index
//! supplied by the caller.

use super::pulse::PulseConfig;
use super::ProtocolError;
use crate::report::{Event, EventKind, ReportSink};

/// Read access to the definition slots of the selected channel
pub trait SlotSource {
    /// Number of slots per channel
    fn slot_count(&self) -> u16;

    /// Read and decode one slot; `None` when it is empty
    fn read_slot(&mut self, index: u16) -> Result<Option<PulseConfig>, ProtocolError>;
}

/// Chosen slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocation {
    pub index: u16,
    /// An occupied slot is overwritten
    pub overwrites: bool,
}

/// Strategy for choosing a definition slot
pub trait SlotAllocator {
    fn allocate(
        &mut self,
        slots: &mut dyn SlotSource,
        sink: &dyn ReportSink,
    ) -> Result<SlotAllocation, ProtocolError>;
}

/// Scan for the first empty slot; when none is left wrap to slot 0
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstEmptySlot;

impl SlotAllocator for FirstEmptySlot {
    fn allocate(
        &mut self,
        slots: &mut dyn SlotSource,
        sink: &dyn ReportSink,
    ) -> Result<SlotAllocation, ProtocolError> {
        let count = slots.slot_count();
        for index in 0..count {
            if slots.read_slot(index)?.is_none() {
                return Ok(SlotAllocation {
                    index,
                    overwrites: false,
                });
            }
        }
        sink.report(Event::warning(EventKind::SlotWrapped { slots: count }));
        Ok(SlotAllocation {
            index: 0,
            overwrites: true,
        })
    }
}

/// Use a caller-supplied slot index without reading the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSlot(pub u16);

impl SlotAllocator for FixedSlot {
    fn allocate(
        &mut self,
        slots: &mut dyn SlotSource,
        _sink: &dyn ReportSink,
    ) -> Result<SlotAllocation, ProtocolError> {
        let count = slots.slot_count();
        if self.0 >= count {
            return Err(ProtocolError::InvalidAddress {
                field: "pulse definition slot",
                value: self.0 as u64,
                limit: count.saturating_sub(1) as u64,
            });
        }
        Ok(SlotAllocation {
            index: self.0,
            overwrites: false,
        })
    }
}
