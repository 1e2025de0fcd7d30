//! Global address lookup table for indirect calls.
//!
//! Layout: `[unresolved, service_0, .., service_n, entry_0, entry_1, ..]`.
//! Entry `HEADER_SLOTS + (addr >> 2)` holds the native routine for the
//! guest function at `addr`. Slots nothing was compiled for point at the
//! unresolved stub, so generated code never has to test for null.

use crate::vm::services::Service;

/// Slot of the unresolved-target stub.
pub const UNRESOLVED_SLOT: usize = 0;

/// Header slots before the per-address entries.
pub const HEADER_SLOTS: usize = 1 + Service::COUNT;

/// Lookup-table slot that holds the trampoline for `service`.
pub fn service_slot(service: Service) -> usize {
    1 + service as usize
}

/// A flat table of native routine addresses read by generated code.
pub struct LookupTable {
    data: Vec<usize>,
    entries: usize,
}

impl LookupTable {
    /// Table covering guest addresses below `text_end`, every slot pointing
    /// at `unresolved`.
    pub fn new(text_end: u32, unresolved: usize) -> Self {
        let entries = entry_count(text_end);
        Self {
            data: vec![unresolved; HEADER_SLOTS + entries],
            entries,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn set_service(&mut self, service: Service, routine: usize) {
        self.data[service_slot(service)] = routine;
    }

    /// Native routine registered for a guest address.
    pub fn routine(&self, addr: u32) -> Option<usize> {
        self.data.get(HEADER_SLOTS + (addr >> 2) as usize).copied()
    }

    /// Base pointer handed to generated code.
    pub fn as_mut_ptr(&mut self) -> *mut usize {
        self.data.as_mut_ptr()
    }
}

/// Number of per-address entries for a text segment ending at `text_end`.
pub fn entry_count(text_end: u32) -> usize {
    (text_end as usize).div_ceil(4)
}
