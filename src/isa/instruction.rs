//! Instruction word views and decoding.

use super::opcode::{Format, Opcode};
use super::register::Register;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {opcode:#04x} at {addr:#010x}")]
    UnknownOpcode { addr: u32, opcode: u8 },
    #[error("instruction at {addr:#010x} runs past the end of the image")]
    Truncated { addr: u32 },
    #[error("invalid register id {id} in instruction at {addr:#010x}")]
    InvalidRegister { addr: u32, id: u8 },
}

/// The four structured views of an instruction word.
///
/// Register fields are kept as raw bytes: depending on the opcode the `rs`
/// and `rt` bytes of a two-sources word may hold immediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Word { opcode: u8, rd: u8, imm: u16 },
    RangeReg { opcode: u8, rs: u8, count: u8 },
    TwoSources { opcode: u8, rd: u8, rs: u8, rt: u8 },
    DestOnly { opcode: u8, rd: u8 },
}

impl Encoding {
    /// Split a word into the view its opcode selects.
    pub fn decode(word: u32) -> Option<Self> {
        let opcode = (word & 0xFF) as u8;
        let b1 = ((word >> 8) & 0xFF) as u8;
        let b2 = ((word >> 16) & 0xFF) as u8;
        let b3 = (word >> 24) as u8;
        let encoding = match Opcode::from_u8(opcode)?.format() {
            Format::Word => Encoding::Word {
                opcode,
                rd: b1,
                imm: (word >> 16) as u16,
            },
            Format::RangeReg => Encoding::RangeReg {
                opcode,
                rs: b1,
                count: b2,
            },
            Format::TwoSources => Encoding::TwoSources {
                opcode,
                rd: b1,
                rs: b2,
                rt: b3,
            },
            Format::DestOnly => Encoding::DestOnly { opcode, rd: b1 },
        };
        Some(encoding)
    }

    pub fn encode(self) -> u32 {
        match self {
            Encoding::Word { opcode, rd, imm } => {
                opcode as u32 | (rd as u32) << 8 | (imm as u32) << 16
            }
            Encoding::RangeReg { opcode, rs, count } => {
                opcode as u32 | (rs as u32) << 8 | (count as u32) << 16
            }
            Encoding::TwoSources { opcode, rd, rs, rt } => {
                opcode as u32 | (rd as u32) << 8 | (rs as u32) << 16 | (rt as u32) << 24
            }
            Encoding::DestOnly { opcode, rd } => opcode as u32 | (rd as u32) << 8,
        }
    }
}

/// Read a little-endian word from the image.
pub fn read_word(image: &[u8], addr: u32) -> Option<u32> {
    let start = addr as usize;
    let bytes = image.get(start..start.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// A decoded instruction at a guest address, with its trailing dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub addr: u32,
    pub opcode: Opcode,
    pub word: u32,
    pub dword: Option<u32>,
}

impl Instruction {
    pub fn decode(image: &[u8], addr: u32) -> Result<Self, DecodeError> {
        let word = read_word(image, addr).ok_or(DecodeError::Truncated { addr })?;
        let byte = (word & 0xFF) as u8;
        let opcode = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode { addr, opcode: byte })?;
        let dword = if opcode.has_dword() {
            let operand_addr = addr.checked_add(4).ok_or(DecodeError::Truncated { addr })?;
            Some(read_word(image, operand_addr).ok_or(DecodeError::Truncated { addr })?)
        } else {
            None
        };
        Ok(Self {
            addr,
            opcode,
            word,
            dword,
        })
    }

    pub fn size(&self) -> u32 {
        self.opcode.size()
    }

    /// Address of the instruction that follows this one.
    pub fn next(&self) -> u32 {
        self.addr.wrapping_add(self.size())
    }

    pub fn byte1(&self) -> u8 {
        (self.word >> 8) as u8
    }

    pub fn byte2(&self) -> u8 {
        (self.word >> 16) as u8
    }

    pub fn byte3(&self) -> u8 {
        (self.word >> 24) as u8
    }

    pub fn imm16(&self) -> u16 {
        (self.word >> 16) as u16
    }

    /// The dword operand, or 0 for opcodes without one.
    pub fn operand(&self) -> u32 {
        self.dword.unwrap_or(0)
    }

    fn register(&self, id: u8) -> Result<Register, DecodeError> {
        Register::from_id(id).ok_or(DecodeError::InvalidRegister {
            addr: self.addr,
            id,
        })
    }

    /// Destination register (byte 1).
    pub fn rd(&self) -> Result<Register, DecodeError> {
        self.register(self.byte1())
    }

    /// First source register (byte 2).
    pub fn rs(&self) -> Result<Register, DecodeError> {
        self.register(self.byte2())
    }

    /// Second source register (byte 3).
    pub fn rt(&self) -> Result<Register, DecodeError> {
        self.register(self.byte3())
    }

    /// Byte 2 read as a signed immediate.
    pub fn imm8_rs(&self) -> i8 {
        self.byte2() as i8
    }

    /// Byte 3 read as a signed immediate.
    pub fn imm8_rt(&self) -> i8 {
        self.byte3() as i8
    }

    /// Target of a compare-immediate branch: a signed word offset in byte 3.
    pub fn short_target(&self) -> u32 {
        self.addr.wrapping_add((self.imm8_rt() as i32 * 4) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(encoding: Encoding) {
        let word = encoding.encode();
        let decoded = Encoding::decode(word).unwrap();
        assert_eq!(decoded, encoding);
        assert_eq!(decoded.encode(), word);
    }

    #[test]
    fn test_views_roundtrip() {
        roundtrip(Encoding::Word {
            opcode: Opcode::Ldq as u8,
            rd: Register::P0.id(),
            imm: 0xBEEF,
        });
        roundtrip(Encoding::RangeReg {
            opcode: Opcode::Store as u8,
            rs: Register::S0.id(),
            count: 12,
        });
        roundtrip(Encoding::TwoSources {
            opcode: Opcode::Add as u8,
            rd: Register::R0.id(),
            rs: Register::P0.id(),
            rt: Register::P1.id(),
        });
        roundtrip(Encoding::DestOnly {
            opcode: Opcode::Jpr as u8,
            rd: Register::Ra.id(),
        });
    }

    #[test]
    fn test_two_sources_field_positions() {
        let word = Encoding::TwoSources {
            opcode: 0x02,
            rd: 0x78,
            rs: 0x30,
            rt: 0x34,
        }
        .encode();
        assert_eq!(word, 0x3430_7802);
    }

    #[test]
    fn test_decode_unknown_opcode() {
        assert_eq!(Encoding::decode(0x0000_00FF), None);
        let image = [0xFFu8, 0, 0, 0];
        assert_eq!(
            Instruction::decode(&image, 0),
            Err(DecodeError::UnknownOpcode { addr: 0, opcode: 0xFF })
        );
    }

    #[test]
    fn test_decode_reads_dword() {
        let mut image = Vec::new();
        image.extend_from_slice(&(Opcode::Ldi as u32 | (Register::P0.id() as u32) << 8).to_le_bytes());
        image.extend_from_slice(&0x8000_0005u32.to_le_bytes());
        let ins = Instruction::decode(&image, 0).unwrap();
        assert_eq!(ins.opcode, Opcode::Ldi);
        assert_eq!(ins.rd(), Ok(Register::P0));
        assert_eq!(ins.dword, Some(0x8000_0005));
        assert_eq!(ins.next(), 8);
    }

    #[test]
    fn test_decode_truncated_dword() {
        let image = (Opcode::Ldi as u32).to_le_bytes();
        assert_eq!(
            Instruction::decode(&image, 0),
            Err(DecodeError::Truncated { addr: 0 })
        );
    }
}
