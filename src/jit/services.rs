//! Native trampolines from generated code into the VM services.
//!
//! Generated code reaches a service with `call [r13 + slot * 8]` while RBX
//! still holds the guest register file. Each trampoline passes the
//! scheduler and P0..P3 to the service function and writes the result to
//! R0 when the service returns one.

use std::collections::BTreeSet;

use tracing::debug;

use super::codebuf::CodeBuffer;
use super::lookup::LookupTable;
use super::memory::{ExecutableMemory, MemoryError};
use super::translator::regs::CTX;
use super::x86_64::{AluOp, Mem, Reg, X86_64Assembler};
use crate::isa::Register;
use crate::vm::scheduler::Scheduler;
use crate::vm::services::Service;

/// Trampolines bound to one scheduler, one per imported service.
pub struct ServiceTrampolines {
    code: Option<ExecutableMemory>,
    offsets: [Option<usize>; Service::COUNT],
}

impl ServiceTrampolines {
    /// Emit a trampoline for each of `services` bound to `scheduler`. A
    /// module that imports no service gets no code at all.
    ///
    /// The scheduler must outlive the returned code.
    pub fn build(scheduler: *const Scheduler, services: &BTreeSet<Service>) -> Result<Self, MemoryError> {
        let mut offsets = [None; Service::COUNT];
        if services.is_empty() {
            return Ok(Self { code: None, offsets });
        }
        let mut buf = CodeBuffer::new();
        for &service in services {
            buf.align(16);
            offsets[service as usize] = Some(buf.offset());
            emit_trampoline(&mut buf, scheduler, service);
        }
        let code = buf.finalize()?;
        debug!(services = services.len(), bytes = code.size(), "service trampolines built");
        Ok(Self {
            code: Some(code),
            offsets,
        })
    }

    /// Native address of a service trampoline, if the service was imported.
    pub fn address(&self, service: Service) -> Option<usize> {
        let code = self.code.as_ref()?;
        let offset = self.offsets[service as usize]?;
        Some(code.as_ptr() as usize + offset)
    }

    /// Point the slots of the built services at their trampolines. The other
    /// service slots keep the unresolved stub.
    pub fn install(&self, lookup: &mut LookupTable) {
        for service in Service::ALL {
            if let Some(addr) = self.address(service) {
                lookup.set_service(service, addr);
            }
        }
    }
}

fn emit_trampoline(buf: &mut CodeBuffer, scheduler: *const Scheduler, service: Service) {
    const ARGS: [Reg; 4] = [Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8];
    const PARAMS: [Register; 4] = [Register::P0, Register::P1, Register::P2, Register::P3];

    let mut asm = X86_64Assembler::new(buf);
    asm.alu_ri64(AluOp::Sub, Reg::Rsp, 8);
    asm.mov_ri64(Reg::Rdi, scheduler as u64);
    for (arg, param) in ARGS.iter().zip(PARAMS).take(service.arg_count()) {
        asm.load32(*arg, Mem::base(CTX, param.id() as i32));
    }
    asm.mov_ri64(Reg::Rax, service.entry() as usize as u64);
    asm.call_r(Reg::Rax);
    if service.returns_value() {
        asm.store32(Mem::base(CTX, Register::R0.id() as i32), Reg::Rax);
    }
    asm.alu_ri64(AluOp::Add, Reg::Rsp, 8);
    asm.ret();
}
