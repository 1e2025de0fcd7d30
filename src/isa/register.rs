//! Guest register file layout.
//!
//! Registers are addressed by their byte offset into the register file, so
//! every valid register id is a multiple of four.

use std::fmt;

/// Number of 32-bit slots in the register file (ZR through PC).
pub const REGISTER_COUNT: usize = 33;

/// A guest register, identified by its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Register {
    Zr = 0,
    Sp = 4,
    Ra = 8,
    Fp = 12,
    S0 = 16,
    S1 = 20,
    S2 = 24,
    S3 = 28,
    S4 = 32,
    S5 = 36,
    S6 = 40,
    S7 = 44,
    P0 = 48,
    P1 = 52,
    P2 = 56,
    P3 = 60,
    G0 = 64,
    G1 = 68,
    G2 = 72,
    G3 = 76,
    G4 = 80,
    G5 = 84,
    G6 = 88,
    G7 = 92,
    G8 = 96,
    G9 = 100,
    G10 = 104,
    G11 = 108,
    G12 = 112,
    G13 = 116,
    R0 = 120,
    R1 = 124,
    Pc = 128,
}

const ALL: [Register; REGISTER_COUNT] = [
    Register::Zr,
    Register::Sp,
    Register::Ra,
    Register::Fp,
    Register::S0,
    Register::S1,
    Register::S2,
    Register::S3,
    Register::S4,
    Register::S5,
    Register::S6,
    Register::S7,
    Register::P0,
    Register::P1,
    Register::P2,
    Register::P3,
    Register::G0,
    Register::G1,
    Register::G2,
    Register::G3,
    Register::G4,
    Register::G5,
    Register::G6,
    Register::G7,
    Register::G8,
    Register::G9,
    Register::G10,
    Register::G11,
    Register::G12,
    Register::G13,
    Register::R0,
    Register::R1,
    Register::Pc,
];

impl Register {
    /// Decode a register byte. Returns `None` for unaligned or out-of-range ids.
    pub fn from_id(id: u8) -> Option<Self> {
        if id & 3 != 0 {
            return None;
        }
        ALL.get((id >> 2) as usize).copied()
    }

    /// Byte offset of this register inside the register file.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Slot index inside the register file.
    pub fn index(self) -> usize {
        (self as u8 >> 2) as usize
    }

    /// Iterate the whole register file in layout order.
    pub fn all() -> impl Iterator<Item = Register> {
        ALL.iter().copied()
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; REGISTER_COUNT] = [
            "zr", "sp", "ra", "fp", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "p0", "p1",
            "p2", "p3", "g0", "g1", "g2", "g3", "g4", "g5", "g6", "g7", "g8", "g9", "g10",
            "g11", "g12", "g13", "r0", "r1", "pc",
        ];
        NAMES[self.index()]
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
