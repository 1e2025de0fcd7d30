//! Opcode table.
//!
//! Each opcode carries its instruction view and whether it is followed by an
//! immediate dword. The table is the single source of truth for instruction
//! sizes used by both analysis and translation.

/// Which structured view of the instruction word an opcode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `opcode | rd | imm16`
    Word,
    /// `opcode | rs | count`
    RangeReg,
    /// `opcode | rd | rs | rt`
    TwoSources,
    /// `opcode | rd`
    DestOnly,
}

/// Comparison performed by a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Ge,
    Geu,
    Gt,
    Gtu,
    Le,
    Leu,
    Lt,
    Ltu,
}

impl Condition {
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Condition::Geu | Condition::Gtu | Condition::Leu | Condition::Ltu
        )
    }

    /// Evaluate the condition on two 32-bit operands.
    pub fn holds(self, a: u32, b: u32) -> bool {
        let (sa, sb) = (a as i32, b as i32);
        match self {
            Condition::Eq => a == b,
            Condition::Ne => a != b,
            Condition::Ge => sa >= sb,
            Condition::Geu => a >= b,
            Condition::Gt => sa > sb,
            Condition::Gtu => a > b,
            Condition::Le => sa <= sb,
            Condition::Leu => a <= b,
            Condition::Lt => sa < sb,
            Condition::Ltu => a < b,
        }
    }
}

/// Operand shape of a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchForm {
    /// `rd ? rs`, target offset in the following dword.
    Registers,
    /// `rd ? sext(imm8)`, target offset `4 * sext(rt)`.
    Immediate,
    /// `low8(rd) ? imm8`, target offset `4 * sext(rt)`.
    ByteImmediate,
}

macro_rules! opcodes {
    ($($name:ident = $value:literal, $mnemonic:literal, $format:ident, $dword:literal;)*) => {
        /// A guest opcode (byte 0 of every instruction word).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            /// Every defined opcode, in numeric order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $(Opcode::$name => Format::$format,)*
                }
            }

            /// Whether the instruction word is followed by an immediate dword.
            pub fn has_dword(self) -> bool {
                match self {
                    $(Opcode::$name => $dword,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x01, "NOP", DestOnly, false;
    Add = 0x02, "ADD", TwoSources, false;
    And = 0x03, "AND", TwoSources, false;
    Mul = 0x04, "MUL", TwoSources, false;
    Div = 0x05, "DIV", TwoSources, false;
    Divu = 0x06, "DIVU", TwoSources, false;
    Or = 0x07, "OR", TwoSources, false;
    Xor = 0x08, "XOR", TwoSources, false;
    Sub = 0x09, "SUB", TwoSources, false;
    Sll = 0x0A, "SLL", TwoSources, false;
    Sra = 0x0B, "SRA", TwoSources, false;
    Srl = 0x0C, "SRL", TwoSources, false;
    Not = 0x0D, "NOT", TwoSources, false;
    Neg = 0x0E, "NEG", TwoSources, false;
    Exsb = 0x0F, "EXSB", TwoSources, false;
    Exsh = 0x10, "EXSH", TwoSources, false;
    Mov = 0x11, "MOV", TwoSources, false;
    Addb = 0x12, "ADDB", TwoSources, false;
    Subb = 0x13, "SUBB", TwoSources, false;
    Andb = 0x14, "ANDB", TwoSources, false;
    Orb = 0x15, "ORB", TwoSources, false;
    Movb = 0x16, "MOVB", TwoSources, false;
    Addh = 0x17, "ADDH", TwoSources, false;
    Subh = 0x18, "SUBH", TwoSources, false;
    Andh = 0x19, "ANDH", TwoSources, false;
    Orh = 0x1A, "ORH", TwoSources, false;
    Movh = 0x1B, "MOVH", TwoSources, false;
    Slli = 0x1C, "SLLi", TwoSources, false;
    Srai = 0x1D, "SRAi", TwoSources, false;
    Srli = 0x1E, "SRLi", TwoSources, false;
    Addq = 0x1F, "ADDQ", TwoSources, false;
    Mulq = 0x20, "MULQ", TwoSources, false;
    Addbi = 0x21, "ADDBi", TwoSources, false;
    Andbi = 0x22, "ANDBi", TwoSources, false;
    Orbi = 0x23, "ORBi", TwoSources, false;
    Sllb = 0x24, "SLLB", TwoSources, false;
    Srlb = 0x25, "SRLB", TwoSources, false;
    Srab = 0x26, "SRAB", TwoSources, false;
    Addhi = 0x27, "ADDHi", TwoSources, false;
    Andhi = 0x28, "ANDHi", TwoSources, false;
    Sllh = 0x29, "SLLH", TwoSources, false;
    Srlh = 0x2A, "SRLH", TwoSources, false;
    Srah = 0x2B, "SRAH", TwoSources, false;
    Beqi = 0x2C, "BEQI", TwoSources, false;
    Bnei = 0x2D, "BNEI", TwoSources, false;
    Bgei = 0x2E, "BGEI", TwoSources, false;
    Bgeui = 0x2F, "BGEUI", TwoSources, false;
    Bgti = 0x30, "BGTI", TwoSources, false;
    Bgtui = 0x31, "BGTUI", TwoSources, false;
    Blei = 0x32, "BLEI", TwoSources, false;
    Bleui = 0x33, "BLEUI", TwoSources, false;
    Blti = 0x34, "BLTI", TwoSources, false;
    Bltui = 0x35, "BLTUI", TwoSources, false;
    Beqib = 0x36, "BEQIB", TwoSources, false;
    Bneib = 0x37, "BNEIB", TwoSources, false;
    Bgeib = 0x38, "BGEIB", TwoSources, false;
    Bgeuib = 0x39, "BGEUIB", TwoSources, false;
    Bgtib = 0x3A, "BGTIB", TwoSources, false;
    Bgtuib = 0x3B, "BGTUIB", TwoSources, false;
    Bleib = 0x3C, "BLEIB", TwoSources, false;
    Bleuib = 0x3D, "BLEUIB", TwoSources, false;
    Bltib = 0x3E, "BLTIB", TwoSources, false;
    Bltuib = 0x3F, "BLTUIB", TwoSources, false;
    Ldq = 0x40, "LDQ", Word, false;
    Jpr = 0x41, "JPr", DestOnly, false;
    Callr = 0x42, "CALLr", DestOnly, false;
    Store = 0x43, "STORE", RangeReg, false;
    Restore = 0x44, "RESTORE", RangeReg, false;
    Ret = 0x45, "RET", DestOnly, false;
    Killtask = 0x46, "KILLTASK", DestOnly, false;
    Sleep = 0x47, "SLEEP", DestOnly, false;
    Syscpy = 0x48, "SYSCPY", TwoSources, false;
    Sysset = 0x49, "SYSSET", TwoSources, false;
    Addi = 0x4A, "ADDi", TwoSources, true;
    Andi = 0x4B, "ANDi", TwoSources, true;
    Muli = 0x4C, "MULi", TwoSources, true;
    Divi = 0x4D, "DIVi", TwoSources, true;
    Divui = 0x4E, "DIVUi", TwoSources, true;
    Ori = 0x4F, "ORi", TwoSources, true;
    Xori = 0x50, "XORi", TwoSources, true;
    Subi = 0x51, "SUBi", TwoSources, true;
    Stbd = 0x52, "STBd", TwoSources, true;
    Sthd = 0x53, "STHd", TwoSources, true;
    Stwd = 0x54, "STWd", TwoSources, true;
    Ldbd = 0x55, "LDBd", TwoSources, true;
    Ldhd = 0x56, "LDHd", TwoSources, true;
    Ldwd = 0x57, "LDWd", TwoSources, true;
    Ldbud = 0x58, "LDBUd", TwoSources, true;
    Ldhud = 0x59, "LDHUd", TwoSources, true;
    Ldi = 0x5A, "LDI", DestOnly, true;
    Jpl = 0x5B, "JPl", DestOnly, true;
    Calll = 0x5C, "CALLl", DestOnly, true;
    Beq = 0x5D, "BEQ", TwoSources, true;
    Bne = 0x5E, "BNE", TwoSources, true;
    Bge = 0x5F, "BGE", TwoSources, true;
    Bgeu = 0x60, "BGEU", TwoSources, true;
    Bgt = 0x61, "BGT", TwoSources, true;
    Bgtu = 0x62, "BGTU", TwoSources, true;
    Ble = 0x63, "BLE", TwoSources, true;
    Bleu = 0x64, "BLEU", TwoSources, true;
    Blt = 0x65, "BLT", TwoSources, true;
    Bltu = 0x66, "BLTU", TwoSources, true;
    Orhi = 0x67, "ORHi", TwoSources, false;
}

impl Opcode {
    /// Instruction size in bytes, including the trailing dword if any.
    pub fn size(self) -> u32 {
        if self.has_dword() { 8 } else { 4 }
    }

    /// Form and condition for conditional branches.
    pub fn branch(self) -> Option<(BranchForm, Condition)> {
        use BranchForm::*;
        use Condition::*;
        let branch = match self {
            Opcode::Beq => (Registers, Eq),
            Opcode::Bne => (Registers, Ne),
            Opcode::Bge => (Registers, Ge),
            Opcode::Bgeu => (Registers, Geu),
            Opcode::Bgt => (Registers, Gt),
            Opcode::Bgtu => (Registers, Gtu),
            Opcode::Ble => (Registers, Le),
            Opcode::Bleu => (Registers, Leu),
            Opcode::Blt => (Registers, Lt),
            Opcode::Bltu => (Registers, Ltu),
            Opcode::Beqi => (Immediate, Eq),
            Opcode::Bnei => (Immediate, Ne),
            Opcode::Bgei => (Immediate, Ge),
            Opcode::Bgeui => (Immediate, Geu),
            Opcode::Bgti => (Immediate, Gt),
            Opcode::Bgtui => (Immediate, Gtu),
            Opcode::Blei => (Immediate, Le),
            Opcode::Bleui => (Immediate, Leu),
            Opcode::Blti => (Immediate, Lt),
            Opcode::Bltui => (Immediate, Ltu),
            Opcode::Beqib => (ByteImmediate, Eq),
            Opcode::Bneib => (ByteImmediate, Ne),
            Opcode::Bgeib => (ByteImmediate, Ge),
            Opcode::Bgeuib => (ByteImmediate, Geu),
            Opcode::Bgtib => (ByteImmediate, Gt),
            Opcode::Bgtuib => (ByteImmediate, Gtu),
            Opcode::Bleib => (ByteImmediate, Le),
            Opcode::Bleuib => (ByteImmediate, Leu),
            Opcode::Bltib => (ByteImmediate, Lt),
            Opcode::Bltuib => (ByteImmediate, Ltu),
            _ => return None,
        };
        Some(branch)
    }
}
