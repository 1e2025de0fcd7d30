//! Recovered function and jump-table records.

use std::collections::BTreeSet;

use crate::isa::Register;

/// A switch recovered from one of the jump-table idioms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTable {
    /// Address of the `JPr` that dispatches through the table.
    pub jump_addr: u32,
    /// Address of the `LDWd` that loads the table slot.
    pub load_addr: u32,
    /// Register holding the slot address minus the load offset.
    pub index_reg: Register,
    /// Guest address of slot 0.
    pub base: u32,
    /// Case targets, one per slot.
    pub labels: Vec<u32>,
}

impl JumpTable {
    /// Guest address range covered by the slots.
    pub fn slot_range(&self) -> std::ops::Range<u32> {
        self.base..self.base + 4 * self.labels.len() as u32
    }
}

/// A function recovered by analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Absolute guest address of the entry.
    pub addr: u32,
    /// Byte length from the entry to the end of the last block.
    pub length: u32,
    /// Block start addresses; always contains `addr`.
    pub labels: BTreeSet<u32>,
    pub jump_tables: Vec<JumpTable>,
}

impl Function {
    pub fn end(&self) -> u32 {
        self.addr + self.length
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && addr < self.end()
    }

    pub fn jump_table_at(&self, jump_addr: u32) -> Option<&JumpTable> {
        self.jump_tables.iter().find(|t| t.jump_addr == jump_addr)
    }

    pub fn jump_table_loaded_at(&self, load_addr: u32) -> Option<&JumpTable> {
        self.jump_tables.iter().find(|t| t.load_addr == load_addr)
    }
}
