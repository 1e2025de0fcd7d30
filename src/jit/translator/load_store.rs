//! Guest memory access, constants and register ranges on the guest stack.

use super::regs::{CTX, MEM, TMP0, TMP1};
use super::{FunctionEmitter, TranslateError, Width, reg_slot};
use crate::isa::{Instruction, REGISTER_COUNT, Register};
use crate::jit::x86_64::{AluOp, Mem, Reg};

/// Bytes in the register file.
const REGISTER_FILE_BYTES: u32 = 4 * REGISTER_COUNT as u32;

impl FunctionEmitter<'_, '_> {
    /// ECX <- rs + dword (32-bit wrap).
    fn emit_address(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        let offset = self.immediate(ins)?;
        self.load_reg(TMP1, ins.rs()?);
        if offset != 0 {
            self.asm.alu_ri32(AluOp::Add, TMP1, offset as i32);
        }
        Ok(())
    }

    /// `rd <- mem[rs + dword]`. The slot load of a recovered jump table also
    /// keeps the slot address in the frame for the dispatch.
    pub(super) fn lower_load(&mut self, ins: &Instruction, width: Width, signed: bool) -> Result<(), TranslateError> {
        let rd = ins.rd()?;
        self.check_writable(ins, rd)?;
        self.emit_address(ins)?;
        if self.function.jump_table_loaded_at(ins.addr).is_some() {
            self.asm.store32(Mem::base(Reg::Rsp, 0), TMP1);
        }
        let addr = Mem::indexed(MEM, TMP1, 0);
        match (width, signed) {
            (Width::Byte, true) => self.asm.load_sx8(TMP0, addr),
            (Width::Byte, false) => self.asm.load_zx8(TMP0, addr),
            (Width::Half, true) => self.asm.load_sx16(TMP0, addr),
            (Width::Half, false) => self.asm.load_zx16(TMP0, addr),
            (Width::Word, _) => self.asm.load32(TMP0, addr),
        }
        self.store_reg(ins, rd, TMP0, Width::Word)
    }

    /// `mem[rs + dword] <- rd`, truncated to `width`.
    pub(super) fn lower_store(&mut self, ins: &Instruction, width: Width) -> Result<(), TranslateError> {
        self.emit_address(ins)?;
        self.load_reg(TMP0, ins.rd()?);
        let addr = Mem::indexed(MEM, TMP1, 0);
        match width {
            Width::Byte => self.asm.store8(addr, TMP0),
            Width::Half => self.asm.store16(addr, TMP0),
            Width::Word => self.asm.store32(addr, TMP0),
        }
        Ok(())
    }

    /// LDQ: sign-extended 16-bit immediate.
    pub(super) fn lower_load_quick(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        let value = ins.imm16() as i16 as i32 as u32;
        self.store_reg_imm(ins, ins.rd()?, value)
    }

    pub(super) fn lower_load_immediate(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        let value = self.immediate(ins)?;
        self.store_reg_imm(ins, ins.rd()?, value)
    }

    /// Byte count of a STORE/RESTORE, checked against the register file.
    fn range_count(&self, ins: &Instruction, first: u32, last: u32) -> Result<u32, TranslateError> {
        let count = ins.byte2() as u32;
        let invalid = TranslateError::InvalidRange {
            addr: ins.addr,
            opcode: ins.opcode.mnemonic(),
        };
        if count == 0 || count % 4 != 0 || first > last || last + 4 > REGISTER_FILE_BYTES {
            return Err(invalid);
        }
        Ok(count)
    }

    /// STORE rs, n: SP -= n, then registers `[rs, rs + n)` go to `[SP]`.
    /// The ZR form pushes RA.
    pub(super) fn lower_store_range(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        let rs = ins.byte1() as u32;
        let (first, count) = if rs == Register::Zr.id() as u32 {
            (Register::Ra.id() as u32, 4)
        } else {
            let count = ins.byte2() as u32;
            let last = (rs + count).saturating_sub(4);
            (rs, self.range_count(ins, rs, last)?)
        };
        if first % 4 != 0 {
            return Err(TranslateError::InvalidRange {
                addr: ins.addr,
                opcode: ins.opcode.mnemonic(),
            });
        }

        self.load_reg(TMP1, Register::Sp);
        self.asm.alu_ri32(AluOp::Sub, TMP1, count as i32);
        for i in 0..count / 4 {
            self.asm.load32(TMP0, Mem::base(CTX, (first + 4 * i) as i32));
            self.asm.store32(Mem::indexed(MEM, TMP1, (4 * i) as i32), TMP0);
        }
        self.asm.store32(reg_slot(Register::Sp), TMP1);
        Ok(())
    }

    /// RESTORE rs, n: registers `[rs - n + 4, rs]` come from `[SP]`, then
    /// SP += n. The ZR form pops RA.
    pub(super) fn lower_restore_range(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        let rs = ins.byte1() as u32;
        let (first, count) = if rs == Register::Zr.id() as u32 {
            (Register::Ra.id() as u32, 4)
        } else {
            let count = ins.byte2() as u32;
            let first = (rs + 4).checked_sub(count).ok_or(TranslateError::InvalidRange {
                addr: ins.addr,
                opcode: ins.opcode.mnemonic(),
            })?;
            (first, self.range_count(ins, first, rs)?)
        };
        if first == Register::Zr.id() as u32 || first % 4 != 0 {
            return Err(TranslateError::InvalidRange {
                addr: ins.addr,
                opcode: ins.opcode.mnemonic(),
            });
        }

        self.load_reg(TMP1, Register::Sp);
        for i in 0..count / 4 {
            self.asm.load32(TMP0, Mem::indexed(MEM, TMP1, (4 * i) as i32));
            self.asm.store32(Mem::base(CTX, (first + 4 * i) as i32), TMP0);
        }
        self.asm.alu_ri32(AluOp::Add, TMP1, count as i32);
        self.asm.store32(reg_slot(Register::Sp), TMP1);
        Ok(())
    }
}
