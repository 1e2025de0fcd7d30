//! Branches, calls and returns.

use super::regs::{HLE, LOOKUP, TMP0, TMP1, USERDATA};
use super::{Flow, FunctionEmitter, TranslateError, reg_slot};
use crate::isa::{BranchForm, Condition, Instruction, Register};
use crate::jit::codebuf::Label;
use crate::jit::lookup::{HEADER_SLOTS, UNRESOLVED_SLOT};
use crate::jit::x86_64::{AluOp, Cond, Mem, Reg, ShiftOp};

fn host_cond(cond: Condition) -> Cond {
    match cond {
        Condition::Eq => Cond::E,
        Condition::Ne => Cond::Ne,
        Condition::Lt => Cond::L,
        Condition::Ltu => Cond::B,
        Condition::Le => Cond::Le,
        Condition::Leu => Cond::Be,
        Condition::Gt => Cond::G,
        Condition::Gtu => Cond::A,
        Condition::Ge => Cond::Ge,
        Condition::Geu => Cond::Ae,
    }
}

impl FunctionEmitter<'_, '_> {
    /// Resolve the dword of a `JPl`/`B<cond>` into a guest address.
    fn dword_target(&self, ins: &Instruction) -> Result<u32, TranslateError> {
        let dword = ins.operand();
        self.translator
            .pool
            .branch_target(ins.addr, dword)
            .ok_or(TranslateError::UnresolvableImmediate { addr: ins.addr, dword })
    }

    fn entry_for(&self, ins: &Instruction, target: u32) -> Result<Label, TranslateError> {
        self.entries
            .get(&target)
            .copied()
            .ok_or(TranslateError::UnknownFunction { addr: ins.addr, target })
    }

    pub(super) fn lower_branch(
        &mut self,
        ins: &Instruction,
        form: BranchForm,
        cond: Condition,
    ) -> Result<(), TranslateError> {
        self.load_reg(TMP0, ins.rd()?);
        let target = match form {
            BranchForm::Registers => {
                self.load_reg(TMP1, ins.rs()?);
                self.asm.alu_rr32(AluOp::Cmp, TMP0, TMP1);
                self.dword_target(ins)?
            }
            BranchForm::Immediate => {
                self.asm.alu_ri32(AluOp::Cmp, TMP0, ins.imm8_rs() as i32);
                ins.short_target()
            }
            BranchForm::ByteImmediate => {
                if cond.is_unsigned() {
                    self.asm.movzx_rr8(TMP0, TMP0);
                    self.asm.alu_ri32(AluOp::Cmp, TMP0, ins.byte2() as i32);
                } else {
                    self.asm.movsx_rr8(TMP0, TMP0);
                    self.asm.alu_ri32(AluOp::Cmp, TMP0, ins.imm8_rs() as i32);
                }
                ins.short_target()
            }
        };
        let label = self.label_for(ins, target)?;
        self.asm.jcc(host_cond(cond), label);
        Ok(())
    }

    /// `JPl`: a local jump, or a tail call when it goes backwards past the
    /// function entry.
    pub(super) fn lower_jump_local(&mut self, ins: &Instruction) -> Result<Flow, TranslateError> {
        let target = self.dword_target(ins)?;
        if target < self.function.addr {
            let entry = self.entry_for(ins, target)?;
            self.asm.store_imm32(reg_slot(Register::Pc), target);
            self.emit_routine_args();
            self.asm.call(entry);
            self.asm.jmp(self.epilogue);
        } else {
            let label = self.label_for(ins, target)?;
            self.asm.jmp(label);
        }
        Ok(Flow::Terminate)
    }

    /// `CALLl`: a VM service, a function of this module or a host import.
    pub(super) fn lower_call_local(&mut self, ins: &Instruction) -> Result<Flow, TranslateError> {
        let operand = ins.operand();
        let next = ins.next();

        if let Some(&service) = self.translator.options.services.get(&operand) {
            self.call_service(ins, service);
            return Ok(Flow::Continue);
        }

        if let Some(target) = self.translator.pool.branch_target(ins.addr, operand) {
            let entry = self.entry_for(ins, target)?;
            self.asm.store_imm32(reg_slot(Register::Ra), next);
            self.asm.store_imm32(reg_slot(Register::Pc), target);
            self.emit_routine_args();
            self.asm.call(entry);
            return Ok(Flow::Continue);
        }

        // Host import: the handler gets the pool index.
        self.asm.store_imm32(reg_slot(Register::Ra), next);
        self.asm.store_imm32(reg_slot(Register::Pc), next);
        self.asm.mov_rr(Reg::Rdi, USERDATA);
        self.asm.mov_ri32(Reg::Rsi, operand);
        self.asm.call_r(HLE);
        if self.translator.pool.is_terminate_function(operand) {
            self.asm.jmp(self.epilogue);
            return Ok(Flow::Terminate);
        }
        Ok(Flow::Continue)
    }

    /// `JPr`: jump-table dispatch, return through RA, or a tail call through
    /// the lookup table.
    pub(super) fn lower_jump_register(&mut self, ins: &Instruction) -> Result<Flow, TranslateError> {
        let rd = ins.rd()?;
        let function = self.function;
        if let Some(table) = function.jump_table_at(ins.addr) {
            let cases = table
                .labels
                .iter()
                .map(|&target| self.label_for(ins, target))
                .collect::<Result<Vec<_>, _>>()?;
            let Some(&default) = cases.first() else {
                return Err(TranslateError::UnknownLabel {
                    addr: ins.addr,
                    target: table.base,
                });
            };
            let base = table.base;
            let table_label = self.asm.buffer().new_label();

            self.asm.load32(TMP0, Mem::base(Reg::Rsp, 0));
            self.asm.alu_ri32(AluOp::Sub, TMP0, base as i32);
            self.asm.shift_ri32(ShiftOp::Shr, TMP0, 2);
            self.asm.alu_ri32(AluOp::Cmp, TMP0, cases.len() as i32);
            self.asm.jcc(Cond::Ae, default);
            self.asm.lea_label(TMP1, table_label);
            self.asm.load_sx32_64(TMP0, Mem::scaled(TMP1, TMP0, 2, 0));
            self.asm.add_rr64(TMP0, TMP1);
            self.asm.jmp_r(TMP0);

            self.tables.push((table_label, cases));
            return Ok(Flow::Terminate);
        }

        if rd != Register::Ra {
            self.load_reg(TMP0, rd);
            self.asm.store32(reg_slot(Register::Pc), TMP0);
            self.emit_indirect_call()?;
        }
        self.asm.jmp(self.epilogue);
        Ok(Flow::Terminate)
    }

    /// `CALLr`: call through the lookup table and continue after it.
    pub(super) fn lower_call_register(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        self.load_reg(TMP0, ins.rd()?);
        self.asm.store32(reg_slot(Register::Pc), TMP0);
        self.asm.store_imm32(reg_slot(Register::Ra), ins.next());
        self.emit_indirect_call()
    }

    /// Call the routine for the guest address in EAX. Addresses past the
    /// table go to the unresolved stub.
    fn emit_indirect_call(&mut self) -> Result<(), TranslateError> {
        let in_range = self.asm.buffer().new_label();
        let limit = HEADER_SLOTS + self.translator.options.lookup_entries;

        self.asm.shift_ri32(ShiftOp::Shr, TMP0, 2);
        self.asm.alu_ri32(AluOp::Add, TMP0, HEADER_SLOTS as i32);
        self.asm.alu_ri32(AluOp::Cmp, TMP0, limit as i32);
        self.asm.jcc(Cond::B, in_range);
        self.asm.mov_ri32(TMP0, UNRESOLVED_SLOT as u32);
        self.asm.buffer().bind(in_range)?;
        self.asm.load64(TMP0, Mem::scaled(LOOKUP, TMP0, 3, 0));
        self.emit_routine_args();
        self.asm.call_r(TMP0);
        Ok(())
    }
}
