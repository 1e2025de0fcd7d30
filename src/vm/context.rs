//! Guest register file.

use crate::isa::{REGISTER_COUNT, Register};

/// The register file generated code reads and writes through `rbx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VmContext {
    regs: [u32; REGISTER_COUNT],
}

impl Default for VmContext {
    fn default() -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
        }
    }
}

impl VmContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: Register) -> u32 {
        if reg == Register::Zr {
            return 0;
        }
        self.regs[reg.index()]
    }

    /// Writes to ZR are dropped; callers that must reject them check first.
    pub fn set(&mut self, reg: Register, value: u32) {
        if reg != Register::Zr {
            self.regs[reg.index()] = value;
        }
    }

    pub fn registers(&self) -> &[u32; REGISTER_COUNT] {
        &self.regs
    }

    /// Slot by index; `None` past the register file.
    pub fn raw(&self, index: usize) -> Option<u32> {
        if index == 0 {
            return Some(0);
        }
        self.regs.get(index).copied()
    }

    /// Returns false when `index` is past the register file. Slot 0 is ZR
    /// and ignores the write.
    pub fn set_raw(&mut self, index: usize, value: u32) -> bool {
        match self.regs.get_mut(index) {
            Some(_) if index == 0 => true,
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
