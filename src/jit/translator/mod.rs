//! Guest-to-x86-64 translator.
//!
//! Every recovered function becomes one native routine:
//!
//! ```text
//! extern "C" fn(ctx, mem, lookup, hle, userdata)
//! ```
//!
//! The arguments are pinned in callee-saved registers for the whole body
//! (see [`regs`]). Guest registers stay in the context and are loaded and
//! stored around each instruction.
//!
//! The module starts with a populate trampoline (same signature) that writes
//! every routine's address into the lookup table, so the emitted code has no
//! absolute addresses and can be cached.

mod arithmetic;
mod control_flow;
mod load_store;
mod misc;

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;

use thiserror::Error;
use tracing::{debug, trace};

use super::codebuf::{CodeBuffer, CodeBufferError, Label};
use super::x86_64::{AluOp, Mem, Reg, ShiftOp, X86_64Assembler};
use super::lookup::HEADER_SLOTS;
use crate::analysis::Function;
use crate::config::DivideByZeroPolicy;
use crate::isa::{BranchForm, Condition, DecodeError, Format, Instruction, Opcode, PoolItems, Register};
use crate::vm::context::VmContext;
use crate::vm::services::Service;

/// Host callback for calls the module does not define.
pub type HleHandler = unsafe extern "C" fn(userdata: *mut c_void, code: i32);

/// Native signature of every translated function and of the populate
/// trampoline.
pub type Routine = unsafe extern "C" fn(
    ctx: *mut VmContext,
    mem: *mut u8,
    lookup: *mut usize,
    hle: HleHandler,
    userdata: *mut c_void,
);

/// Register conventions inside translated code.
///
/// - RBX: guest register file
/// - R12: guest memory base
/// - R13: lookup table
/// - R14: HLE handler
/// - R15: HLE userdata
/// - RAX, RCX, RDX, RSI, RDI: scratch
pub mod regs {
    use super::Reg;

    pub const CTX: Reg = Reg::Rbx;
    pub const MEM: Reg = Reg::R12;
    pub const LOOKUP: Reg = Reg::R13;
    pub const HLE: Reg = Reg::R14;
    pub const USERDATA: Reg = Reg::R15;

    pub const TMP0: Reg = Reg::Rax;
    pub const TMP1: Reg = Reg::Rcx;
    pub const TMP2: Reg = Reg::Rdx;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    CodeBuffer(#[from] CodeBufferError),
    #[error("{opcode} at {addr:#010x} writes the zero register")]
    WriteToZero { addr: u32, opcode: &'static str },
    #[error("immediate {dword:#010x} at {addr:#010x} cannot be resolved")]
    UnresolvableImmediate { addr: u32, dword: u32 },
    #[error("branch at {addr:#010x} targets {target:#010x}, which is not a block of its function")]
    UnknownLabel { addr: u32, target: u32 },
    #[error("call at {addr:#010x} targets {target:#010x}, which is not a recovered function")]
    UnknownFunction { addr: u32, target: u32 },
    #[error("{opcode} at {addr:#010x} has an invalid register range")]
    InvalidRange { addr: u32, opcode: &'static str },
    #[error("no lowering for opcode {0}")]
    MissingLowering(&'static str),
    #[error("lowering for {0} does not match its instruction format")]
    InconsistentLowering(&'static str),
}

/// Operand width of an arithmetic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    fn bits(self) -> u8 {
        match self {
            Width::Byte => 8,
            Width::Half => 16,
            Width::Word => 32,
        }
    }
}

/// Where the second operand of an arithmetic instruction comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// Register in byte 3
    Reg,
    /// Byte 3, sign-extended
    Imm8Signed,
    /// Byte 3, zero-extended
    Imm8Unsigned,
    /// The trailing dword
    Dword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    Exsb,
    Exsh,
    Mov,
    Movb,
    Movh,
}

/// How one opcode is lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lowering {
    Nop,
    Alu { op: AluOp, width: Width, source: Source },
    Mul { source: Source },
    Div { signed: bool, source: Source },
    Shift { op: ShiftOp, width: Width, source: Source },
    Unary(UnaryOp),
    Load { width: Width, signed: bool },
    Store { width: Width },
    LoadQuick,
    LoadImmediate,
    Branch { form: BranchForm, cond: Condition },
    JumpLocal,
    CallLocal,
    JumpRegister,
    CallRegister,
    Return,
    StoreRange,
    RestoreRange,
    Sleep,
    KillTask,
    SysCopy,
    SysSet,
}

impl Lowering {
    fn for_opcode(op: Opcode) -> Option<Lowering> {
        use AluOp::{Add, And, Or, Sub, Xor};
        use Lowering::*;
        use ShiftOp::{Sar, Shl, Shr};

        if let Some((form, cond)) = op.branch() {
            return Some(Branch { form, cond });
        }
        let lowering = match op {
            Opcode::Nop => Nop,
            Opcode::Add => Alu { op: Add, width: Width::Word, source: Source::Reg },
            Opcode::Sub => Alu { op: Sub, width: Width::Word, source: Source::Reg },
            Opcode::And => Alu { op: And, width: Width::Word, source: Source::Reg },
            Opcode::Or => Alu { op: Or, width: Width::Word, source: Source::Reg },
            Opcode::Xor => Alu { op: Xor, width: Width::Word, source: Source::Reg },
            Opcode::Mul => Mul { source: Source::Reg },
            Opcode::Div => Div { signed: true, source: Source::Reg },
            Opcode::Divu => Div { signed: false, source: Source::Reg },
            Opcode::Sll => Shift { op: Shl, width: Width::Word, source: Source::Reg },
            Opcode::Sra => Shift { op: Sar, width: Width::Word, source: Source::Reg },
            Opcode::Srl => Shift { op: Shr, width: Width::Word, source: Source::Reg },
            Opcode::Not => Unary(UnaryOp::Not),
            Opcode::Neg => Unary(UnaryOp::Neg),
            Opcode::Exsb => Unary(UnaryOp::Exsb),
            Opcode::Exsh => Unary(UnaryOp::Exsh),
            Opcode::Mov => Unary(UnaryOp::Mov),
            Opcode::Movb => Unary(UnaryOp::Movb),
            Opcode::Movh => Unary(UnaryOp::Movh),
            Opcode::Addb => Alu { op: Add, width: Width::Byte, source: Source::Reg },
            Opcode::Subb => Alu { op: Sub, width: Width::Byte, source: Source::Reg },
            Opcode::Andb => Alu { op: And, width: Width::Byte, source: Source::Reg },
            Opcode::Orb => Alu { op: Or, width: Width::Byte, source: Source::Reg },
            Opcode::Addh => Alu { op: Add, width: Width::Half, source: Source::Reg },
            Opcode::Subh => Alu { op: Sub, width: Width::Half, source: Source::Reg },
            Opcode::Andh => Alu { op: And, width: Width::Half, source: Source::Reg },
            Opcode::Orh => Alu { op: Or, width: Width::Half, source: Source::Reg },
            Opcode::Sllb => Shift { op: Shl, width: Width::Byte, source: Source::Reg },
            Opcode::Srlb => Shift { op: Shr, width: Width::Byte, source: Source::Reg },
            Opcode::Srab => Shift { op: Sar, width: Width::Byte, source: Source::Reg },
            Opcode::Sllh => Shift { op: Shl, width: Width::Half, source: Source::Reg },
            Opcode::Srlh => Shift { op: Shr, width: Width::Half, source: Source::Reg },
            Opcode::Srah => Shift { op: Sar, width: Width::Half, source: Source::Reg },
            Opcode::Slli => Shift { op: Shl, width: Width::Word, source: Source::Imm8Unsigned },
            Opcode::Srai => Shift { op: Sar, width: Width::Word, source: Source::Imm8Unsigned },
            Opcode::Srli => Shift { op: Shr, width: Width::Word, source: Source::Imm8Unsigned },
            Opcode::Addq => Alu { op: Add, width: Width::Word, source: Source::Imm8Signed },
            Opcode::Mulq => Mul { source: Source::Imm8Unsigned },
            Opcode::Addbi => Alu { op: Add, width: Width::Byte, source: Source::Imm8Unsigned },
            Opcode::Andbi => Alu { op: And, width: Width::Byte, source: Source::Imm8Unsigned },
            Opcode::Orbi => Alu { op: Or, width: Width::Byte, source: Source::Imm8Unsigned },
            Opcode::Addhi => Alu { op: Add, width: Width::Half, source: Source::Imm8Signed },
            Opcode::Andhi => Alu { op: And, width: Width::Half, source: Source::Imm8Unsigned },
            Opcode::Orhi => Alu { op: Or, width: Width::Half, source: Source::Imm8Unsigned },
            Opcode::Addi => Alu { op: Add, width: Width::Word, source: Source::Dword },
            Opcode::Subi => Alu { op: Sub, width: Width::Word, source: Source::Dword },
            Opcode::Andi => Alu { op: And, width: Width::Word, source: Source::Dword },
            Opcode::Ori => Alu { op: Or, width: Width::Word, source: Source::Dword },
            Opcode::Xori => Alu { op: Xor, width: Width::Word, source: Source::Dword },
            Opcode::Muli => Mul { source: Source::Dword },
            Opcode::Divi => Div { signed: true, source: Source::Dword },
            Opcode::Divui => Div { signed: false, source: Source::Dword },
            Opcode::Ldbd => Load { width: Width::Byte, signed: true },
            Opcode::Ldbud => Load { width: Width::Byte, signed: false },
            Opcode::Ldhd => Load { width: Width::Half, signed: true },
            Opcode::Ldhud => Load { width: Width::Half, signed: false },
            Opcode::Ldwd => Load { width: Width::Word, signed: false },
            Opcode::Stbd => Store { width: Width::Byte },
            Opcode::Sthd => Store { width: Width::Half },
            Opcode::Stwd => Store { width: Width::Word },
            Opcode::Ldq => LoadQuick,
            Opcode::Ldi => LoadImmediate,
            Opcode::Jpl => JumpLocal,
            Opcode::Calll => CallLocal,
            Opcode::Jpr => JumpRegister,
            Opcode::Callr => CallRegister,
            Opcode::Ret => Return,
            Opcode::Store => StoreRange,
            Opcode::Restore => RestoreRange,
            Opcode::Sleep => Sleep,
            Opcode::Killtask => KillTask,
            Opcode::Syscpy => SysCopy,
            Opcode::Sysset => SysSet,
            _ => return None,
        };
        Some(lowering)
    }

    /// Instruction view the lowering reads.
    fn format(self) -> Format {
        match self {
            Lowering::LoadQuick => Format::Word,
            Lowering::StoreRange | Lowering::RestoreRange => Format::RangeReg,
            Lowering::Nop
            | Lowering::LoadImmediate
            | Lowering::JumpLocal
            | Lowering::CallLocal
            | Lowering::JumpRegister
            | Lowering::CallRegister
            | Lowering::Return
            | Lowering::Sleep
            | Lowering::KillTask => Format::DestOnly,
            _ => Format::TwoSources,
        }
    }

    /// Whether the lowering consumes the trailing dword.
    fn uses_dword(self) -> bool {
        match self {
            Lowering::Alu { source, .. }
            | Lowering::Mul { source }
            | Lowering::Div { source, .. }
            | Lowering::Shift { source, .. } => source == Source::Dword,
            Lowering::Branch { form, .. } => form == BranchForm::Registers,
            Lowering::Load { .. }
            | Lowering::Store { .. }
            | Lowering::LoadImmediate
            | Lowering::JumpLocal
            | Lowering::CallLocal => true,
            _ => false,
        }
    }
}

/// Result of translating a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub code: Vec<u8>,
    /// Offset of the populate trampoline.
    pub populate_offset: usize,
    /// Whether any code calls the task services.
    pub uses_task_subsystem: bool,
    /// Services the code calls through the lookup table.
    pub services: BTreeSet<Service>,
    pub function_count: usize,
}

/// Codegen settings fixed for the lifetime of a translator.
#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    pub divide_by_zero: DivideByZeroPolicy,
    /// Pool index → service for `CALLl` operands bound to VM services.
    pub services: BTreeMap<u32, Service>,
    /// Number of per-address lookup-table entries.
    pub lookup_entries: usize,
}

/// Whether execution can continue into the next instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

pub struct Translator<'a> {
    image: &'a [u8],
    pool: &'a PoolItems,
    options: TranslateOptions,
    table: [Option<Lowering>; 256],
}

impl<'a> Translator<'a> {
    /// Build the opcode dispatch table and check it against the opcode
    /// metadata.
    pub fn new(image: &'a [u8], pool: &'a PoolItems, options: TranslateOptions) -> Result<Self, TranslateError> {
        let mut table = [None; 256];
        for &op in Opcode::ALL {
            table[op as usize] = Lowering::for_opcode(op);
        }
        for &op in Opcode::ALL {
            let lowering = table[op as usize].ok_or(TranslateError::MissingLowering(op.mnemonic()))?;
            if lowering.format() != op.format() || lowering.uses_dword() != op.has_dword() {
                return Err(TranslateError::InconsistentLowering(op.mnemonic()));
            }
        }
        Ok(Self {
            image,
            pool,
            options,
            table,
        })
    }

    /// Translate every function into one position-independent code blob.
    pub fn translate(&self, functions: &[Function]) -> Result<CompiledModule, TranslateError> {
        let mut buf = CodeBuffer::new();
        let entries: BTreeMap<u32, Label> = functions.iter().map(|f| (f.addr, buf.new_label())).collect();

        emit_populate(&mut buf, &entries);

        let mut services = BTreeSet::new();
        for function in functions {
            buf.align(16);
            let start = buf.offset();
            let emitter = FunctionEmitter::new(self, &mut buf, function, &entries);
            services.extend(emitter.emit()?);
            trace!(
                function = format_args!("{:#x}", function.addr),
                native_offset = start,
                native_size = buf.offset() - start,
                "function translated"
            );
        }

        let code = buf.finish()?;
        let uses_task_subsystem = !services.is_empty();
        debug!(
            functions = functions.len(),
            bytes = code.len(),
            uses_task_subsystem,
            "module translated"
        );
        Ok(CompiledModule {
            code,
            populate_offset: 0,
            uses_task_subsystem,
            services,
            function_count: functions.len(),
        })
    }
}

/// `[rbx + id]` for a guest register.
fn reg_slot(reg: Register) -> Mem {
    Mem::base(regs::CTX, reg.id() as i32)
}

/// Lookup-table writer at offset 0. Only uses the third argument (RDX).
fn emit_populate(buf: &mut CodeBuffer, entries: &BTreeMap<u32, Label>) {
    let mut asm = X86_64Assembler::new(buf);
    for (&addr, &label) in entries {
        asm.lea_label(Reg::Rax, label);
        asm.mov_ri32(Reg::Rcx, (HEADER_SLOTS + (addr >> 2) as usize) as u32);
        asm.store64(Mem::scaled(Reg::Rdx, Reg::Rcx, 3, 0), Reg::Rax);
    }
    asm.ret();
}

/// Save callee-saved registers, keep the stack 16-byte aligned with one
/// spare slot at `[rsp]`, and pin the routine arguments.
fn emit_prologue(asm: &mut X86_64Assembler<'_>) {
    asm.push(Reg::Rbp);
    asm.mov_rr(Reg::Rbp, Reg::Rsp);
    asm.push(Reg::Rbx);
    asm.push(Reg::R12);
    asm.push(Reg::R13);
    asm.push(Reg::R14);
    asm.push(Reg::R15);
    asm.alu_ri64(AluOp::Sub, Reg::Rsp, 8);
    asm.mov_rr(regs::CTX, Reg::Rdi);
    asm.mov_rr(regs::MEM, Reg::Rsi);
    asm.mov_rr(regs::LOOKUP, Reg::Rdx);
    asm.mov_rr(regs::HLE, Reg::Rcx);
    asm.mov_rr(regs::USERDATA, Reg::R8);
}

fn emit_epilogue(asm: &mut X86_64Assembler<'_>) {
    asm.alu_ri64(AluOp::Add, Reg::Rsp, 8);
    asm.pop(Reg::R15);
    asm.pop(Reg::R14);
    asm.pop(Reg::R13);
    asm.pop(Reg::R12);
    asm.pop(Reg::Rbx);
    asm.pop(Reg::Rbp);
    asm.ret();
}

/// Emits one function.
struct FunctionEmitter<'t, 'b> {
    translator: &'t Translator<'t>,
    asm: X86_64Assembler<'b>,
    function: &'t Function,
    entries: &'t BTreeMap<u32, Label>,
    /// Native label of every block in the function.
    labels: BTreeMap<u32, Label>,
    epilogue: Label,
    /// Jump tables to emit after the body: table label and case labels.
    tables: Vec<(Label, Vec<Label>)>,
    services: BTreeSet<Service>,
}

impl<'t, 'b> FunctionEmitter<'t, 'b> {
    fn new(
        translator: &'t Translator<'t>,
        buf: &'b mut CodeBuffer,
        function: &'t Function,
        entries: &'t BTreeMap<u32, Label>,
    ) -> Self {
        let labels = function.labels.iter().map(|&addr| (addr, buf.new_label())).collect();
        let epilogue = buf.new_label();
        Self {
            translator,
            asm: X86_64Assembler::new(buf),
            function,
            entries,
            labels,
            epilogue,
            tables: Vec::new(),
            services: BTreeSet::new(),
        }
    }

    /// Emit the routine. Returns the services it calls.
    fn emit(mut self) -> Result<BTreeSet<Service>, TranslateError> {
        let entry = self
            .entries
            .get(&self.function.addr)
            .copied()
            .ok_or(TranslateError::UnknownFunction {
                addr: self.function.addr,
                target: self.function.addr,
            })?;
        self.asm.buffer().bind(entry)?;
        emit_prologue(&mut self.asm);

        let end = self.function.end();
        let mut cursor = self.function.addr;
        let mut live = false;
        while cursor < end {
            if let Some(&label) = self.labels.get(&cursor) {
                self.asm.buffer().bind(label)?;
                live = true;
            }
            if !live {
                // Unreachable bytes between blocks; resume at the next block.
                match self.labels.range(cursor + 1..).next() {
                    Some((&next, _)) => {
                        cursor = next;
                        continue;
                    }
                    None => break,
                }
            }
            let ins = Instruction::decode(self.translator.image, cursor)?;
            if self.lower(&ins)? == Flow::Terminate {
                live = false;
            }
            cursor = ins.next();
        }

        let epilogue = self.epilogue;
        self.asm.buffer().bind(epilogue)?;
        emit_epilogue(&mut self.asm);

        for (table, cases) in std::mem::take(&mut self.tables) {
            self.asm.buffer().align(4);
            self.asm.buffer().bind(table)?;
            for case in cases {
                self.asm.table_entry(case, table);
            }
        }
        Ok(self.services)
    }

    fn lower(&mut self, ins: &Instruction) -> Result<Flow, TranslateError> {
        let lowering = self.translator.table[ins.opcode as usize]
            .ok_or(TranslateError::MissingLowering(ins.opcode.mnemonic()))?;
        match lowering {
            Lowering::Nop => {}
            Lowering::Alu { op, width, source } => self.lower_alu(ins, op, width, source)?,
            Lowering::Mul { source } => self.lower_mul(ins, source)?,
            Lowering::Div { signed, source } => self.lower_div(ins, signed, source)?,
            Lowering::Shift { op, width, source } => self.lower_shift(ins, op, width, source)?,
            Lowering::Unary(op) => self.lower_unary(ins, op)?,
            Lowering::Load { width, signed } => self.lower_load(ins, width, signed)?,
            Lowering::Store { width } => self.lower_store(ins, width)?,
            Lowering::LoadQuick => self.lower_load_quick(ins)?,
            Lowering::LoadImmediate => self.lower_load_immediate(ins)?,
            Lowering::Branch { form, cond } => self.lower_branch(ins, form, cond)?,
            Lowering::JumpLocal => return self.lower_jump_local(ins),
            Lowering::CallLocal => return self.lower_call_local(ins),
            Lowering::JumpRegister => return self.lower_jump_register(ins),
            Lowering::CallRegister => self.lower_call_register(ins)?,
            Lowering::Return => {
                self.asm.jmp(self.epilogue);
                return Ok(Flow::Terminate);
            }
            Lowering::StoreRange => self.lower_store_range(ins)?,
            Lowering::RestoreRange => self.lower_restore_range(ins)?,
            Lowering::Sleep => self.call_service(ins, Service::Yield),
            Lowering::KillTask => self.call_service(ins, Service::Kill),
            Lowering::SysCopy => self.lower_sys_copy(ins)?,
            Lowering::SysSet => self.lower_sys_set(ins)?,
        }
        Ok(Flow::Continue)
    }

    // ==================== Shared helpers ====================

    /// Load a guest register; ZR becomes `xor`.
    fn load_reg(&mut self, dst: Reg, reg: Register) {
        if reg == Register::Zr {
            self.asm.alu_rr32(AluOp::Xor, dst, dst);
        } else {
            self.asm.load32(dst, reg_slot(reg));
        }
    }

    fn check_writable(&self, ins: &Instruction, reg: Register) -> Result<(), TranslateError> {
        if reg == Register::Zr {
            return Err(TranslateError::WriteToZero {
                addr: ins.addr,
                opcode: ins.opcode.mnemonic(),
            });
        }
        Ok(())
    }

    /// Store the low `width` bits of `src` into a guest register.
    fn store_reg(&mut self, ins: &Instruction, reg: Register, src: Reg, width: Width) -> Result<(), TranslateError> {
        self.check_writable(ins, reg)?;
        match width {
            Width::Byte => self.asm.store8(reg_slot(reg), src),
            Width::Half => self.asm.store16(reg_slot(reg), src),
            Width::Word => self.asm.store32(reg_slot(reg), src),
        }
        Ok(())
    }

    fn store_reg_imm(&mut self, ins: &Instruction, reg: Register, value: u32) -> Result<(), TranslateError> {
        self.check_writable(ins, reg)?;
        self.asm.store_imm32(reg_slot(reg), value);
        Ok(())
    }

    /// Resolve the trailing dword as an immediate.
    fn immediate(&self, ins: &Instruction) -> Result<u32, TranslateError> {
        let dword = ins.operand();
        self.translator
            .pool
            .read_immediate(dword)
            .ok_or(TranslateError::UnresolvableImmediate { addr: ins.addr, dword })
    }

    /// Value of a non-register source.
    fn source_immediate(&self, ins: &Instruction, source: Source) -> Result<Option<u32>, TranslateError> {
        Ok(match source {
            Source::Reg => None,
            Source::Imm8Signed => Some(ins.imm8_rt() as i32 as u32),
            Source::Imm8Unsigned => Some(ins.byte3() as u32),
            Source::Dword => Some(self.immediate(ins)?),
        })
    }

    fn label_for(&self, ins: &Instruction, target: u32) -> Result<Label, TranslateError> {
        self.labels
            .get(&target)
            .copied()
            .ok_or(TranslateError::UnknownLabel { addr: ins.addr, target })
    }

    /// Move the pinned registers into the argument registers of a routine.
    fn emit_routine_args(&mut self) {
        self.asm.mov_rr(Reg::Rdi, regs::CTX);
        self.asm.mov_rr(Reg::Rsi, regs::MEM);
        self.asm.mov_rr(Reg::Rdx, regs::LOOKUP);
        self.asm.mov_rr(Reg::Rcx, regs::HLE);
        self.asm.mov_rr(Reg::R8, regs::USERDATA);
    }
}
