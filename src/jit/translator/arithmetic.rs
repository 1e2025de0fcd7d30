//! 8/16/32-bit arithmetic, multiply, divide and shifts.

use super::regs::{TMP0, TMP1, TMP2};
use super::{FunctionEmitter, Source, TranslateError, UnaryOp, Width};
use crate::config::DivideByZeroPolicy;
use crate::isa::Instruction;
use crate::jit::x86_64::{AluOp, Cond, Reg, ShiftOp};

impl FunctionEmitter<'_, '_> {
    /// `rd <- rs op source`, keeping only `width` bits in rd.
    pub(super) fn lower_alu(
        &mut self,
        ins: &Instruction,
        op: AluOp,
        width: Width,
        source: Source,
    ) -> Result<(), TranslateError> {
        let rd = ins.rd()?;
        self.check_writable(ins, rd)?;
        self.load_reg(TMP0, ins.rs()?);
        match self.source_immediate(ins, source)? {
            Some(imm) => self.asm.alu_ri32(op, TMP0, imm as i32),
            None => {
                self.load_reg(TMP1, ins.rt()?);
                self.asm.alu_rr32(op, TMP0, TMP1);
            }
        }
        self.store_reg(ins, rd, TMP0, width)
    }

    pub(super) fn lower_mul(&mut self, ins: &Instruction, source: Source) -> Result<(), TranslateError> {
        let rd = ins.rd()?;
        self.check_writable(ins, rd)?;
        self.load_reg(TMP0, ins.rs()?);
        self.load_source(ins, TMP1, source)?;
        self.asm.imul_rr32(TMP0, TMP1);
        self.store_reg(ins, rd, TMP0, Width::Word)
    }

    /// Quotient of rs by the source.
    ///
    /// A zero divisor follows the engine policy: under `ZeroResult` it is
    /// tested and rd becomes 0, under `Trap` the `div` faults. Signed
    /// division by -1 is a negation so it can never overflow.
    pub(super) fn lower_div(&mut self, ins: &Instruction, signed: bool, source: Source) -> Result<(), TranslateError> {
        let rd = ins.rd()?;
        self.check_writable(ins, rd)?;
        let policy = self.translator.options.divide_by_zero;

        if let Some(divisor) = self.source_immediate(ins, source)? {
            if divisor == 0 && policy == DivideByZeroPolicy::ZeroResult {
                return self.store_reg_imm(ins, rd, 0);
            }
            self.load_reg(TMP0, ins.rs()?);
            if signed && divisor == u32::MAX {
                self.asm.neg32(TMP0);
            } else {
                self.asm.mov_ri32(TMP1, divisor);
                self.emit_divide(signed);
            }
            return self.store_reg(ins, rd, TMP0, Width::Word);
        }

        self.load_reg(TMP0, ins.rs()?);
        self.load_reg(TMP1, ins.rt()?);
        let done = self.asm.buffer().new_label();

        if policy == DivideByZeroPolicy::ZeroResult {
            let nonzero = self.asm.buffer().new_label();
            self.asm.test_rr32(TMP1, TMP1);
            self.asm.jcc(Cond::Ne, nonzero);
            self.store_reg_imm(ins, rd, 0)?;
            self.asm.jmp(done);
            self.asm.buffer().bind(nonzero)?;
        }

        if signed {
            let regular = self.asm.buffer().new_label();
            let store = self.asm.buffer().new_label();
            self.asm.alu_ri32(AluOp::Cmp, TMP1, -1);
            self.asm.jcc(Cond::Ne, regular);
            self.asm.neg32(TMP0);
            self.asm.jmp(store);
            self.asm.buffer().bind(regular)?;
            self.emit_divide(true);
            self.asm.buffer().bind(store)?;
        } else {
            self.emit_divide(false);
        }
        self.store_reg(ins, rd, TMP0, Width::Word)?;
        self.asm.buffer().bind(done)?;
        Ok(())
    }

    /// EAX <- EAX / ECX
    fn emit_divide(&mut self, signed: bool) {
        if signed {
            self.asm.cdq();
            self.asm.idiv32(TMP1);
        } else {
            self.asm.alu_rr32(AluOp::Xor, TMP2, TMP2);
            self.asm.div32(TMP1);
        }
    }

    /// Shifts operate on the operand width; the count is masked to
    /// `width - 1`.
    pub(super) fn lower_shift(
        &mut self,
        ins: &Instruction,
        op: ShiftOp,
        width: Width,
        source: Source,
    ) -> Result<(), TranslateError> {
        let rd = ins.rd()?;
        self.check_writable(ins, rd)?;
        let mask = width.bits() - 1;

        self.load_reg(TMP0, ins.rs()?);
        match (width, op) {
            (Width::Byte, ShiftOp::Shr) => self.asm.movzx_rr8(TMP0, TMP0),
            (Width::Byte, ShiftOp::Sar) => self.asm.movsx_rr8(TMP0, TMP0),
            (Width::Half, ShiftOp::Shr) => self.asm.movzx_rr16(TMP0, TMP0),
            (Width::Half, ShiftOp::Sar) => self.asm.movsx_rr16(TMP0, TMP0),
            _ => {}
        }

        match self.source_immediate(ins, source)? {
            Some(count) => {
                let count = count as u8 & mask;
                if count != 0 {
                    self.asm.shift_ri32(op, TMP0, count);
                }
            }
            None => {
                self.load_reg(TMP1, ins.rt()?);
                if width != Width::Word {
                    self.asm.alu_ri32(AluOp::And, TMP1, mask as i32);
                }
                self.asm.shift_cl32(op, TMP0);
            }
        }
        self.store_reg(ins, rd, TMP0, width)
    }

    pub(super) fn lower_unary(&mut self, ins: &Instruction, op: UnaryOp) -> Result<(), TranslateError> {
        let rd = ins.rd()?;
        self.check_writable(ins, rd)?;
        self.load_reg(TMP0, ins.rs()?);
        let width = match op {
            UnaryOp::Not => {
                self.asm.not32(TMP0);
                Width::Word
            }
            UnaryOp::Neg => {
                self.asm.neg32(TMP0);
                Width::Word
            }
            UnaryOp::Exsb => {
                self.asm.movsx_rr8(TMP0, TMP0);
                Width::Word
            }
            UnaryOp::Exsh => {
                self.asm.movsx_rr16(TMP0, TMP0);
                Width::Word
            }
            UnaryOp::Mov => Width::Word,
            UnaryOp::Movb => Width::Byte,
            UnaryOp::Movh => Width::Half,
        };
        self.store_reg(ins, rd, TMP0, width)
    }

    /// Put the second operand in `dst`.
    fn load_source(&mut self, ins: &Instruction, dst: Reg, source: Source) -> Result<(), TranslateError> {
        match self.source_immediate(ins, source)? {
            Some(imm) => self.asm.mov_ri32(dst, imm),
            None => self.load_reg(dst, ins.rt()?),
        }
        Ok(())
    }
}
