//! x86-64 instruction encoding.
//!
//! Guest arithmetic is 32-bit, so most operations here are the 32-bit forms.
//! Memory operands go through [`Mem`], which covers `[base + disp]` and
//! `[base + index * scale + disp]`. Branches reference [`Label`]s in the
//! code buffer.

use super::codebuf::{CodeBuffer, Label, ReferenceSize};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low three bits of the register number.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether the register needs a REX extension bit.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// x86-64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// Two-operand ALU operations sharing the classic encoding group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// `/digit` used by the immediate forms.
    fn ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }

    /// `op r/m, r` opcode.
    fn opcode(self) -> u8 {
        (self.ext() << 3) | 0x01
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn ext(self) -> u8 {
        match self {
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }
}

/// A memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    base: Reg,
    /// Index register and log2 of the scale.
    index: Option<(Reg, u8)>,
    disp: i32,
}

impl Mem {
    /// `[base + disp]`
    pub fn base(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    /// `[base + index + disp]`
    pub fn indexed(base: Reg, index: Reg, disp: i32) -> Self {
        Self::scaled(base, index, 0, disp)
    }

    /// `[base + index * (1 << scale) + disp]`; `index` must not be RSP.
    pub fn scaled(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        debug_assert!(index != Reg::Rsp);
        debug_assert!(scale <= 3);
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

/// x86-64 assembler writing into a [`CodeBuffer`].
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn buffer(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    // ==================== Encoding helpers ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit a REX prefix when any bit is needed (or `force` for byte regs).
    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8, force: bool) {
        let rex = 0x40
            | if w { 0x08 } else { 0 }
            | if reg >= 8 { 0x04 } else { 0 }
            | if index >= 8 { 0x02 } else { 0 }
            | if base >= 8 { 0x01 } else { 0 };
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    fn emit_mem(&mut self, reg: u8, mem: Mem) {
        let base = mem.base.code();
        let mode = if mem.disp == 0 && base != 0b101 {
            0b00
        } else if (-128..=127).contains(&mem.disp) {
            0b01
        } else {
            0b10
        };
        match mem.index {
            Some((index, scale)) => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(Self::modrm(scale, index.code(), base));
            }
            None if base == 0b100 => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(0x24);
            }
            None => self.buf.emit_u8(Self::modrm(mode, reg, base)),
        }
        match mode {
            0b01 => self.buf.emit_u8(mem.disp as u8),
            0b10 => self.buf.emit_u32(mem.disp as u32),
            _ => {}
        }
    }

    /// `[prefix] [REX] opcode modrm(mem)`
    fn op_mem(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, mem: Mem, byte_reg: bool) {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        let index = mem.index.map_or(0, |(index, _)| index as u8);
        let force = byte_reg && (4..8).contains(&reg);
        self.rex(w, reg, index, mem.base as u8, force);
        self.buf.emit_bytes(opcode);
        self.emit_mem(reg, mem);
    }

    /// `[REX] opcode modrm(reg, rm)` with register-direct addressing.
    fn op_reg(&mut self, w: bool, opcode: &[u8], reg: u8, rm: Reg, byte_rm: bool) {
        let force = byte_rm && (4..8).contains(&(rm as u8));
        self.rex(w, reg, 0, rm as u8, force);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm.code()));
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.op_reg(true, &[0x89], src as u8, dst, false);
    }

    /// MOV r32, r32 (zero-extends into the full register)
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x89], src as u8, dst, false);
    }

    /// MOV r32, imm32
    pub fn mov_ri32(&mut self, dst: Reg, imm: u32) {
        self.rex(false, 0, 0, dst as u8, false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.rex(true, 0, 0, dst as u8, false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// MOV r32, [mem]
    pub fn load32(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, false, &[0x8B], dst as u8, mem, false);
    }

    /// MOV r64, [mem]
    pub fn load64(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, true, &[0x8B], dst as u8, mem, false);
    }

    /// MOV [mem], r32
    pub fn store32(&mut self, mem: Mem, src: Reg) {
        self.op_mem(None, false, &[0x89], src as u8, mem, false);
    }

    /// MOV [mem], r64
    pub fn store64(&mut self, mem: Mem, src: Reg) {
        self.op_mem(None, true, &[0x89], src as u8, mem, false);
    }

    /// MOV [mem], r16
    pub fn store16(&mut self, mem: Mem, src: Reg) {
        self.op_mem(Some(0x66), false, &[0x89], src as u8, mem, false);
    }

    /// MOV [mem], r8
    pub fn store8(&mut self, mem: Mem, src: Reg) {
        self.op_mem(None, false, &[0x88], src as u8, mem, true);
    }

    /// MOV dword [mem], imm32
    pub fn store_imm32(&mut self, mem: Mem, imm: u32) {
        self.op_mem(None, false, &[0xC7], 0, mem, false);
        self.buf.emit_u32(imm);
    }

    /// MOVZX r32, byte [mem]
    pub fn load_zx8(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, false, &[0x0F, 0xB6], dst as u8, mem, false);
    }

    /// MOVSX r32, byte [mem]
    pub fn load_sx8(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, false, &[0x0F, 0xBE], dst as u8, mem, false);
    }

    /// MOVZX r32, word [mem]
    pub fn load_zx16(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, false, &[0x0F, 0xB7], dst as u8, mem, false);
    }

    /// MOVSX r32, word [mem]
    pub fn load_sx16(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, false, &[0x0F, 0xBF], dst as u8, mem, false);
    }

    /// MOVSXD r64, dword [mem]
    pub fn load_sx32_64(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, true, &[0x63], dst as u8, mem, false);
    }

    /// MOVZX r32, r8
    pub fn movzx_rr8(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x0F, 0xB6], dst as u8, src, true);
    }

    /// MOVSX r32, r8
    pub fn movsx_rr8(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x0F, 0xBE], dst as u8, src, true);
    }

    /// MOVZX r32, r16
    pub fn movzx_rr16(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x0F, 0xB7], dst as u8, src, false);
    }

    /// MOVSX r32, r16
    pub fn movsx_rr16(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x0F, 0xBF], dst as u8, src, false);
    }

    /// LEA r64, [mem]
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(None, true, &[0x8D], dst as u8, mem, false);
    }

    /// LEA r64, [rip + label]
    pub fn lea_label(&mut self, dst: Reg, label: Label) {
        self.rex(true, dst as u8, 0, 0, false);
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b101));
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    // ==================== Arithmetic ====================

    /// `op r32, r32`
    pub fn alu_rr32(&mut self, op: AluOp, dst: Reg, src: Reg) {
        self.op_reg(false, &[op.opcode()], src as u8, dst, false);
    }

    fn alu_ri(&mut self, w: bool, op: AluOp, dst: Reg, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.op_reg(w, &[0x83], op.ext(), dst, false);
            self.buf.emit_u8(imm as u8);
        } else {
            self.op_reg(w, &[0x81], op.ext(), dst, false);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// `op r32, imm32`
    pub fn alu_ri32(&mut self, op: AluOp, dst: Reg, imm: i32) {
        self.alu_ri(false, op, dst, imm);
    }

    /// `op r64, imm32` (sign-extended)
    pub fn alu_ri64(&mut self, op: AluOp, dst: Reg, imm: i32) {
        self.alu_ri(true, op, dst, imm);
    }

    /// ADD r64, r64
    pub fn add_rr64(&mut self, dst: Reg, src: Reg) {
        self.op_reg(true, &[0x01], src as u8, dst, false);
    }

    /// IMUL r32, r32
    pub fn imul_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x0F, 0xAF], dst as u8, src, false);
    }

    /// NOT r32
    pub fn not32(&mut self, dst: Reg) {
        self.op_reg(false, &[0xF7], 2, dst, false);
    }

    /// NEG r32
    pub fn neg32(&mut self, dst: Reg) {
        self.op_reg(false, &[0xF7], 3, dst, false);
    }

    /// DIV r32 (EDX:EAX / r32, unsigned)
    pub fn div32(&mut self, src: Reg) {
        self.op_reg(false, &[0xF7], 6, src, false);
    }

    /// IDIV r32 (EDX:EAX / r32, signed)
    pub fn idiv32(&mut self, src: Reg) {
        self.op_reg(false, &[0xF7], 7, src, false);
    }

    /// CDQ (sign-extend EAX into EDX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// Shift r32 by CL
    pub fn shift_cl32(&mut self, op: ShiftOp, dst: Reg) {
        self.op_reg(false, &[0xD3], op.ext(), dst, false);
    }

    /// Shift r32 by an immediate
    pub fn shift_ri32(&mut self, op: ShiftOp, dst: Reg, imm: u8) {
        self.op_reg(false, &[0xC1], op.ext(), dst, false);
        self.buf.emit_u8(imm);
    }

    /// TEST r32, r32
    pub fn test_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_reg(false, &[0x85], src as u8, dst, false);
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to a label
    pub fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
        self.buf.note_jump(label);
    }

    /// Jcc rel32 to a label
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// CALL rel32 to a label
    pub fn call(&mut self, label: Label) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.op_reg(false, &[0xFF], 2, reg, false);
    }

    /// CALL qword [mem]
    pub fn call_mem(&mut self, mem: Mem) {
        self.op_mem(None, false, &[0xFF], 2, mem, false);
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        self.op_reg(false, &[0xFF], 4, reg, false);
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// Rel32 entry of a jump table, relative to `base`.
    pub fn table_entry(&mut self, target: Label, base: Label) {
        self.buf.emit_label_ref(target, ReferenceSize::TableEntry(base));
    }

    // ==================== String / misc ====================

    /// REP MOVSB (copy RCX bytes from [RSI] to [RDI])
    pub fn rep_movsb(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0xA4]);
    }

    /// REP STOSB (fill RCX bytes at [RDI] with AL)
    pub fn rep_stosb(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0xAA]);
    }

    /// UD2
    pub fn ud2(&mut self) {
        self.buf.emit_bytes(&[0x0F, 0x0B]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Assembler<'_>)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RBX, RDI = 48 89 FB
        assert_eq!(encode(|a| a.mov_rr(Reg::Rbx, Reg::Rdi)), [0x48, 0x89, 0xFB]);
        // MOV R12, RSI = 49 89 F4
        assert_eq!(encode(|a| a.mov_rr(Reg::R12, Reg::Rsi)), [0x49, 0x89, 0xF4]);
    }

    #[test]
    fn test_mov_ri32() {
        assert_eq!(encode(|a| a.mov_ri32(Reg::Rax, 5)), [0xB8, 5, 0, 0, 0]);
        assert_eq!(encode(|a| a.mov_ri32(Reg::R8, 1)), [0x41, 0xB8, 1, 0, 0, 0]);
    }

    #[test]
    fn test_load_store_ctx() {
        // MOV EAX, [RBX+0x30] = 8B 43 30
        assert_eq!(encode(|a| a.load32(Reg::Rax, Mem::base(Reg::Rbx, 0x30))), [0x8B, 0x43, 0x30]);
        // MOV [RBX+0x78], EAX = 89 43 78
        assert_eq!(encode(|a| a.store32(Mem::base(Reg::Rbx, 0x78), Reg::Rax)), [0x89, 0x43, 0x78]);
        // MOV [RBX+0x10], AX = 66 89 43 10
        assert_eq!(
            encode(|a| a.store16(Mem::base(Reg::Rbx, 0x10), Reg::Rax)),
            [0x66, 0x89, 0x43, 0x10]
        );
    }

    #[test]
    fn test_rsp_base_needs_sib() {
        // MOV [RSP], EAX = 89 04 24
        assert_eq!(encode(|a| a.store32(Mem::base(Reg::Rsp, 0), Reg::Rax)), [0x89, 0x04, 0x24]);
    }

    #[test]
    fn test_guest_memory_indexed() {
        // MOV [R12+RAX], CL = 41 88 0C 04
        assert_eq!(
            encode(|a| a.store8(Mem::indexed(Reg::R12, Reg::Rax, 0), Reg::Rcx)),
            [0x41, 0x88, 0x0C, 0x04]
        );
        // MOVSX EAX, WORD [R12+RAX] = 41 0F BF 04 04
        assert_eq!(
            encode(|a| a.load_sx16(Reg::Rax, Mem::indexed(Reg::R12, Reg::Rax, 0))),
            [0x41, 0x0F, 0xBF, 0x04, 0x04]
        );
    }

    #[test]
    fn test_r13_base_needs_disp8() {
        // MOV RAX, [R13+RAX*8] = 49 8B 44 C5 00
        assert_eq!(
            encode(|a| a.load64(Reg::Rax, Mem::scaled(Reg::R13, Reg::Rax, 3, 0))),
            [0x49, 0x8B, 0x44, 0xC5, 0x00]
        );
    }

    #[test]
    fn test_store_imm32() {
        // MOV DWORD [RBX+0x78], 7 = C7 43 78 07 00 00 00
        assert_eq!(
            encode(|a| a.store_imm32(Mem::base(Reg::Rbx, 0x78), 7)),
            [0xC7, 0x43, 0x78, 7, 0, 0, 0]
        );
    }

    #[test]
    fn test_movsxd_table_load() {
        // MOVSXD RAX, [RCX+RAX*4] = 48 63 04 81
        assert_eq!(
            encode(|a| a.load_sx32_64(Reg::Rax, Mem::scaled(Reg::Rcx, Reg::Rax, 2, 0))),
            [0x48, 0x63, 0x04, 0x81]
        );
    }

    #[test]
    fn test_alu() {
        // ADD EAX, ECX = 01 C8
        assert_eq!(encode(|a| a.alu_rr32(AluOp::Add, Reg::Rax, Reg::Rcx)), [0x01, 0xC8]);
        // CMP EAX, -1 = 83 F8 FF
        assert_eq!(encode(|a| a.alu_ri32(AluOp::Cmp, Reg::Rax, -1)), [0x83, 0xF8, 0xFF]);
        // AND EAX, 0x1000 = 81 E0 00 10 00 00
        assert_eq!(
            encode(|a| a.alu_ri32(AluOp::And, Reg::Rax, 0x1000)),
            [0x81, 0xE0, 0x00, 0x10, 0x00, 0x00]
        );
        // SUB RSP, 8 = 48 83 EC 08
        assert_eq!(encode(|a| a.alu_ri64(AluOp::Sub, Reg::Rsp, 8)), [0x48, 0x83, 0xEC, 0x08]);
        // XOR EAX, EAX = 31 C0
        assert_eq!(encode(|a| a.alu_rr32(AluOp::Xor, Reg::Rax, Reg::Rax)), [0x31, 0xC0]);
    }

    #[test]
    fn test_mul_div() {
        assert_eq!(encode(|a| a.imul_rr32(Reg::Rax, Reg::Rcx)), [0x0F, 0xAF, 0xC1]);
        assert_eq!(encode(|a| a.idiv32(Reg::Rcx)), [0xF7, 0xF9]);
        assert_eq!(encode(|a| a.div32(Reg::Rcx)), [0xF7, 0xF1]);
        assert_eq!(encode(|a| a.cdq()), [0x99]);
        assert_eq!(encode(|a| a.neg32(Reg::Rax)), [0xF7, 0xD8]);
        assert_eq!(encode(|a| a.not32(Reg::Rax)), [0xF7, 0xD0]);
    }

    #[test]
    fn test_shifts_and_extends() {
        assert_eq!(encode(|a| a.shift_cl32(ShiftOp::Shl, Reg::Rax)), [0xD3, 0xE0]);
        assert_eq!(encode(|a| a.shift_ri32(ShiftOp::Sar, Reg::Rax, 3)), [0xC1, 0xF8, 0x03]);
        assert_eq!(encode(|a| a.movsx_rr8(Reg::Rax, Reg::Rax)), [0x0F, 0xBE, 0xC0]);
        assert_eq!(encode(|a| a.movzx_rr16(Reg::Rax, Reg::Rcx)), [0x0F, 0xB7, 0xC1]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(encode(|a| a.push(Reg::Rbx)), [0x53]);
        assert_eq!(encode(|a| a.push(Reg::R12)), [0x41, 0x54]);
        assert_eq!(encode(|a| a.pop(Reg::R15)), [0x41, 0x5F]);
    }

    #[test]
    fn test_indirect_calls() {
        assert_eq!(encode(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(encode(|a| a.call_r(Reg::R14)), [0x41, 0xFF, 0xD6]);
        assert_eq!(encode(|a| a.jmp_r(Reg::Rax)), [0xFF, 0xE0]);
        // CALL [R13+0x10] = 41 FF 55 10
        assert_eq!(encode(|a| a.call_mem(Mem::base(Reg::R13, 0x10))), [0x41, 0xFF, 0x55, 0x10]);
    }

    #[test]
    fn test_label_branches() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        {
            let mut asm = X86_64Assembler::new(&mut buf);
            asm.jcc(Cond::E, target);
            asm.ret();
        }
        buf.bind(target).unwrap();
        let code = buf.finish().unwrap();
        assert_eq!(code, [0x0F, 0x84, 1, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn test_lea_label() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.bind(target).unwrap();
        X86_64Assembler::new(&mut buf).lea_label(Reg::Rax, target);
        let code = buf.finish().unwrap();
        assert_eq!(code, [0x48, 0x8D, 0x05, 0xF9, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_string_ops() {
        assert_eq!(encode(|a| a.rep_movsb()), [0xF3, 0xA4]);
        assert_eq!(encode(|a| a.rep_stosb()), [0xF3, 0xAA]);
    }
}
