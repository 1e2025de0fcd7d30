//! Service calls and bulk memory operations.

use super::regs::{LOOKUP, MEM, TMP0, TMP1, TMP2};
use super::{FunctionEmitter, TranslateError, reg_slot};
use crate::isa::{Instruction, Register};
use crate::jit::lookup::service_slot;
use crate::jit::x86_64::{Mem, Reg};
use crate::vm::services::Service;

impl FunctionEmitter<'_, '_> {
    /// Call a service trampoline through its lookup-table slot. PC points
    /// past the call so a resumed task continues after it.
    pub(super) fn call_service(&mut self, ins: &Instruction, service: Service) {
        self.services.insert(service);
        self.asm.store_imm32(reg_slot(Register::Pc), ins.next());
        self.asm.call_mem(Mem::base(LOOKUP, (service_slot(service) * 8) as i32));
    }

    /// SYSCPY rd, rs, rt: copy rt bytes from rs to rd.
    pub(super) fn lower_sys_copy(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        self.load_reg(TMP1, ins.rt()?);
        self.load_reg(TMP0, ins.rs()?);
        self.asm.lea(Reg::Rsi, Mem::indexed(MEM, TMP0, 0));
        self.load_reg(TMP0, ins.rd()?);
        self.asm.lea(Reg::Rdi, Mem::indexed(MEM, TMP0, 0));
        self.asm.rep_movsb();
        Ok(())
    }

    /// SYSSET rd, rs, rt: fill rt bytes at rd with the low byte of rs.
    pub(super) fn lower_sys_set(&mut self, ins: &Instruction) -> Result<(), TranslateError> {
        self.load_reg(TMP1, ins.rt()?);
        self.load_reg(TMP2, ins.rd()?);
        self.asm.lea(Reg::Rdi, Mem::indexed(MEM, TMP2, 0));
        self.load_reg(TMP0, ins.rs()?);
        self.asm.rep_stosb();
        Ok(())
    }
}
