//! x64 Instruction Encoding
//!
//! Direct machine code generation for x64 instructions.
//! No external assembler dependency.
//!
//! ## Instruction Format
//!
//! ```text
//! [Legacy Prefix] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```
//!
//! Memory operands are either `[base + disp]` or `[rip + disp32]`.
//! Every emitter whose displacement is not known yet returns the buffer
//! offset of that 4-byte field so the caller can patch it later.

use crate::error::{CompileError, Result};

use super::registers::{Reg64, Xmm};

/// Growable byte buffer for emitting instructions or constant data
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit multiple bytes
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a 16-bit little-endian value
    #[inline]
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit little-endian value
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit little-endian value
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Zero-pad until the offset is a multiple of `align`
    pub fn align_to(&mut self, align: usize) {
        if align > 1 {
            while self.code.len() % align != 0 {
                self.code.push(0);
            }
        }
    }

    /// Patch a 32-bit value at the given offset
    pub fn patch_i32(&mut self, offset: usize, value: i32) -> Result<()> {
        let len = self.code.len();
        let field = offset
            .checked_add(4)
            .and_then(|end| self.code.get_mut(offset..end))
            .ok_or_else(|| {
                CompileError::internal(format!(
                    "patch at offset {} is outside the {}-byte buffer",
                    offset, len
                ))
            })?;
        field.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read back a 32-bit value (used to inspect resolved displacements)
    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        let bytes = self.code.get(offset..offset.checked_add(4)?)?;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Take ownership of the generated code
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

impl From<Vec<u8>> for CodeBuffer {
    fn from(code: Vec<u8>) -> Self {
        Self { code }
    }
}

/// REX prefix builder
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    w: bool, // 64-bit operand size
    r: bool, // ModR/M reg extension
    x: bool, // SIB index extension
    b: bool, // ModR/M r/m or SIB base extension
    force: bool,
}

impl Rex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set W bit (64-bit operand size)
    pub fn w(mut self) -> Self {
        self.w = true;
        self
    }

    /// Set R bit (reg field extension for r8-r15)
    pub fn r(mut self) -> Self {
        self.r = true;
        self
    }

    /// Set B bit (r/m or base field extension for r8-r15)
    pub fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// Emit the prefix even when no bit is set (SPL/BPL/SIL/DIL byte access)
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Set R when `ext`
    fn r_if(self, ext: bool) -> Self {
        if ext {
            self.r()
        } else {
            self
        }
    }

    /// Set B when `ext`
    fn b_if(self, ext: bool) -> Self {
        if ext {
            self.b()
        } else {
            self
        }
    }

    /// Check if REX prefix is needed
    pub fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b || self.force
    }

    /// Encode to byte (0x40-0x4F)
    pub fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3)
            | ((self.r as u8) << 2)
            | ((self.x as u8) << 1)
            | (self.b as u8)
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Create ModR/M for register-to-register (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for register with opcode extension (mod=11)
    pub fn reg_opext(opext: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: opext & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for a memory operand
    pub fn mem(mod_: u8, reg: u8, rm: u8) -> Self {
        Self {
            mod_: mod_ & 0x03,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

/// Condition codes (low nibble of Jcc / SETcc opcodes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Overflow
    O = 0x0,
    NO = 0x1,
    /// Below (unsigned <, CF=1)
    B = 0x2,
    /// Above or equal (unsigned >=)
    AE = 0x3,
    E = 0x4,
    NE = 0x5,
    /// Below or equal (unsigned <=)
    BE = 0x6,
    /// Above (unsigned >)
    A = 0x7,
    /// Sign (negative)
    S = 0x8,
    NS = 0x9,
    /// Parity (unordered after UCOMISD)
    P = 0xA,
    NP = 0xB,
    L = 0xC,
    GE = 0xD,
    LE = 0xE,
    G = 0xF,
}

/// Operand encoding helpers
impl CodeBuffer {
    fn emit_rex(&mut self, rex: Rex) {
        if rex.is_needed() {
            self.emit(rex.encode());
        }
    }

    /// ModR/M (+ SIB) (+ disp) for `[base + disp]`
    fn emit_mem_operand(&mut self, reg: u8, base: Reg64, disp: i32) {
        let mode = if disp == 0 && !base.needs_disp() {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        self.emit(ModRM::mem(mode, reg, base.encoding()).encode());
        if base.needs_sib() {
            self.emit(0x24); // SIB: no index, base = rsp/r12
        }
        match mode {
            0b01 => self.emit(disp as i8 as u8),
            0b10 => self.emit_i32(disp),
            _ => {}
        }
    }

    /// ModR/M + disp32 placeholder for `[rip + disp32]`
    fn emit_rip_operand(&mut self, reg: u8) -> usize {
        self.emit(ModRM::mem(0b00, reg, 0b101).encode());
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    /// REX.W + op /r with reg = `reg`, r/m = `rm` (register form)
    fn emit_rr64(&mut self, opcode: &[u8], reg: Reg64, rm: Reg64) {
        self.emit_rex(
            Rex::new()
                .w()
                .r_if(reg.needs_rex_ext())
                .b_if(rm.needs_rex_ext()),
        );
        self.emit_bytes(opcode);
        self.emit(ModRM::reg_reg(reg.encoding(), rm.encoding()).encode());
    }

    /// REX.W + op /ext with r/m = `rm` (register form)
    fn emit_ext64(&mut self, opcode: u8, ext: u8, rm: Reg64) {
        self.emit_rex(Rex::new().w().b_if(rm.needs_rex_ext()));
        self.emit(opcode);
        self.emit(ModRM::reg_opext(ext, rm.encoding()).encode());
    }

    /// REX.W + op /r with a `[base + disp]` operand
    fn emit_rm64(&mut self, opcode: u8, reg: Reg64, base: Reg64, disp: i32) {
        self.emit_rex(
            Rex::new()
                .w()
                .r_if(reg.needs_rex_ext())
                .b_if(base.needs_rex_ext()),
        );
        self.emit(opcode);
        self.emit_mem_operand(reg.encoding(), base, disp);
    }

    /// REX.W + op /r with a `[rip + disp32]` operand
    fn emit_rip64(&mut self, opcode: u8, reg: Reg64) -> usize {
        self.emit_rex(Rex::new().w().r_if(reg.needs_rex_ext()));
        self.emit(opcode);
        self.emit_rip_operand(reg.encoding())
    }

    /// prefix [REX] 0F op /r between two XMM registers
    fn emit_sse_rr(&mut self, prefix: u8, opcode: u8, reg: Xmm, rm: Xmm) {
        self.emit(prefix);
        self.emit_rex(
            Rex::new()
                .r_if(reg.needs_rex_ext())
                .b_if(rm.needs_rex_ext()),
        );
        self.emit(0x0F);
        self.emit(opcode);
        self.emit(ModRM::reg_reg(reg.encoding(), rm.encoding()).encode());
    }

    /// prefix [REX] 0F op /r with a `[base + disp]` operand
    fn emit_sse_mem(&mut self, prefix: u8, opcode: u8, reg: Xmm, base: Reg64, disp: i32) {
        self.emit(prefix);
        self.emit_rex(
            Rex::new()
                .r_if(reg.needs_rex_ext())
                .b_if(base.needs_rex_ext()),
        );
        self.emit(0x0F);
        self.emit(opcode);
        self.emit_mem_operand(reg.encoding(), base, disp);
    }

    /// prefix [REX] 0F op /r with a `[rip + disp32]` operand
    fn emit_sse_rip(&mut self, prefix: u8, opcode: u8, reg: Xmm) -> usize {
        self.emit(prefix);
        self.emit_rex(Rex::new().r_if(reg.needs_rex_ext()));
        self.emit(0x0F);
        self.emit(opcode);
        self.emit_rip_operand(reg.encoding())
    }

    /// prefix REX.W 0F op /r mixing an XMM and a general register
    fn emit_sse_gpr(
        &mut self,
        prefix: u8,
        opcode: u8,
        reg: u8,
        reg_ext: bool,
        rm: u8,
        rm_ext: bool,
    ) {
        self.emit(prefix);
        self.emit_rex(Rex::new().w().r_if(reg_ext).b_if(rm_ext));
        self.emit(0x0F);
        self.emit(opcode);
        self.emit(ModRM::reg_reg(reg, rm).encode());
    }
}

/// x64 instruction emitter
impl CodeBuffer {
    // ==================== Data Movement ====================

    /// MOV r64, imm64 (movabs)
    pub fn mov_r64_imm64(&mut self, dst: Reg64, imm: u64) {
        self.emit_rex(Rex::new().w().b_if(dst.needs_rex_ext()));
        self.emit(0xB8 + dst.encoding()); // B8+rd
        self.emit_u64(imm);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        self.emit_ext64(0xC7, 0, dst); // C7 /0
        self.emit_i32(imm);
    }

    /// MOV r64, imm (shortest form that preserves the value)
    pub fn mov_r64_imm(&mut self, dst: Reg64, imm: i64) {
        match i32::try_from(imm) {
            Ok(small) => self.mov_r64_imm32(dst, small),
            Err(_) => self.mov_r64_imm64(dst, imm as u64),
        }
    }

    /// MOV r64, r64
    pub fn mov_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x89], src, dst); // 89 /r
    }

    /// MOV r64, [base + disp]
    pub fn mov_r64_mem(&mut self, dst: Reg64, base: Reg64, disp: i32) {
        self.emit_rm64(0x8B, dst, base, disp); // 8B /r
    }

    /// MOV [base + disp], r64
    pub fn mov_mem_r64(&mut self, base: Reg64, disp: i32, src: Reg64) {
        self.emit_rm64(0x89, src, base, disp); // 89 /r
    }

    /// MOV byte [base + disp], r8
    pub fn mov_mem_r8(&mut self, base: Reg64, disp: i32, src: Reg64) {
        let mut rex = Rex::new()
            .r_if(src.needs_rex_ext())
            .b_if(base.needs_rex_ext());
        if src.needs_rex_for_byte() {
            rex = rex.forced();
        }
        self.emit_rex(rex);
        self.emit(0x88); // 88 /r
        self.emit_mem_operand(src.encoding(), base, disp);
    }

    /// MOV r64, [rip + disp32]
    pub fn mov_r64_rip(&mut self, dst: Reg64) -> usize {
        self.emit_rip64(0x8B, dst)
    }

    /// MOV [rip + disp32], r64
    pub fn mov_rip_r64(&mut self, src: Reg64) -> usize {
        self.emit_rip64(0x89, src)
    }

    /// LEA r64, [base + disp]
    pub fn lea_r64_mem(&mut self, dst: Reg64, base: Reg64, disp: i32) {
        self.emit_rm64(0x8D, dst, base, disp); // 8D /r
    }

    /// LEA r64, [rip + disp32]
    pub fn lea_r64_rip(&mut self, dst: Reg64) -> usize {
        self.emit_rip64(0x8D, dst)
    }

    /// MOVZX r64, r8 (zero-extend byte to 64-bit)
    pub fn movzx_r64_r8(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x0F, 0xB6], dst, src); // 0F B6 /r
    }

    // ==================== Arithmetic ====================

    /// ADD r64, r64
    pub fn add_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x01], src, dst); // 01 /r
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        self.emit_ext64(0x81, 0, dst); // 81 /0
        self.emit_i32(imm);
    }

    /// SUB r64, r64
    pub fn sub_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x29], src, dst); // 29 /r
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        self.emit_ext64(0x81, 5, dst); // 81 /5
        self.emit_i32(imm);
    }

    /// IMUL r64, r64
    pub fn imul_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x0F, 0xAF], dst, src); // 0F AF /r
    }

    /// CQO (sign-extend RAX into RDX:RAX for division)
    pub fn cqo(&mut self) {
        self.emit(Rex::new().w().encode());
        self.emit(0x99);
    }

    /// IDIV r64 (signed divide RDX:RAX by r64, quotient in RAX, remainder in RDX)
    pub fn idiv_r64(&mut self, divisor: Reg64) {
        self.emit_ext64(0xF7, 7, divisor); // F7 /7
    }

    /// NEG r64 (two's complement negation)
    pub fn neg_r64(&mut self, dst: Reg64) {
        self.emit_ext64(0xF7, 3, dst); // F7 /3
    }

    /// INC r64
    pub fn inc_r64(&mut self, dst: Reg64) {
        self.emit_ext64(0xFF, 0, dst); // FF /0
    }

    /// DEC r64
    pub fn dec_r64(&mut self, dst: Reg64) {
        self.emit_ext64(0xFF, 1, dst); // FF /1
    }

    // ==================== Bitwise Operations ====================

    /// XOR r64, r64 (often used to zero a register)
    pub fn xor_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x31], src, dst); // 31 /r
    }

    /// AND r64, r64
    pub fn and_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x21], src, dst); // 21 /r
    }

    /// AND r64, imm32 (sign-extended)
    pub fn and_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        self.emit_ext64(0x81, 4, dst); // 81 /4
        self.emit_i32(imm);
    }

    /// OR r64, r64
    pub fn or_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit_rr64(&[0x09], src, dst); // 09 /r
    }

    /// SHL r64, CL (shift left by value in CL register)
    pub fn shl_r64_cl(&mut self, dst: Reg64) {
        self.emit_ext64(0xD3, 4, dst); // D3 /4
    }

    /// SAR r64, CL (arithmetic shift right by value in CL register)
    pub fn sar_r64_cl(&mut self, dst: Reg64) {
        self.emit_ext64(0xD3, 7, dst); // D3 /7
    }

    /// NOT r64 (bitwise NOT, one's complement)
    pub fn not_r64(&mut self, dst: Reg64) {
        self.emit_ext64(0xF7, 2, dst); // F7 /2
    }

    // ==================== Comparison ====================

    /// CMP r64, r64
    pub fn cmp_r64_r64(&mut self, left: Reg64, right: Reg64) {
        self.emit_rr64(&[0x39], right, left); // 39 /r
    }

    /// CMP r64, imm32
    pub fn cmp_r64_imm32(&mut self, left: Reg64, imm: i32) {
        self.emit_ext64(0x81, 7, left); // 81 /7
        self.emit_i32(imm);
    }

    /// CMP byte [base + disp], imm8
    pub fn cmp_mem8_imm8(&mut self, base: Reg64, disp: i32, imm: u8) {
        self.emit_rex(Rex::new().b_if(base.needs_rex_ext()));
        self.emit(0x80); // 80 /7 ib
        self.emit_mem_operand(7, base, disp);
        self.emit(imm);
    }

    /// TEST r64, r64
    pub fn test_r64_r64(&mut self, left: Reg64, right: Reg64) {
        self.emit_rr64(&[0x85], right, left); // 85 /r
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg64) {
        let mut rex = Rex::new().b_if(dst.needs_rex_ext());
        if dst.needs_rex_for_byte() {
            rex = rex.forced();
        }
        self.emit_rex(rex);
        self.emit(0x0F);
        self.emit(0x90 + cond as u8); // 0F 90+cc /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push_r64(&mut self, reg: Reg64) {
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x50 + reg.encoding()); // 50+rd
    }

    /// POP r64
    pub fn pop_r64(&mut self, reg: Reg64) {
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x58 + reg.encoding()); // 58+rd
    }

    // ==================== Control Flow ====================

    /// RET
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// LEAVE (mov rsp, rbp; pop rbp)
    pub fn leave(&mut self) {
        self.emit(0xC9);
    }

    /// JMP rel32 (near jump, returns offset of the displacement for patching)
    pub fn jmp_rel32(&mut self) -> usize {
        self.emit(0xE9); // E9 cd
        let offset = self.offset();
        self.emit_i32(0); // placeholder
        offset
    }

    /// Jcc rel32 (conditional near jump, returns offset of the displacement)
    pub fn jcc_rel32(&mut self, cond: Cond) -> usize {
        self.emit(0x0F);
        self.emit(0x80 + cond as u8); // 0F 80+cc cd
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    /// CALL rel32 (near call, returns offset of the displacement)
    pub fn call_rel32(&mut self) -> usize {
        self.emit(0xE8); // E8 cd
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    // ==================== System ====================

    /// SYSCALL
    pub fn syscall(&mut self) {
        self.emit(0x0F);
        self.emit(0x05);
    }

    /// REP MOVSB (copy RCX bytes from [RSI] to [RDI])
    pub fn rep_movsb(&mut self) {
        self.emit(0xF3);
        self.emit(0xA4);
    }

    /// REPE CMPSB (compare RCX bytes of [RSI] and [RDI] while equal)
    pub fn repe_cmpsb(&mut self) {
        self.emit(0xF3);
        self.emit(0xA6);
    }

    /// NOP
    pub fn nop(&mut self) {
        self.emit(0x90);
    }

    // ==================== Scalar Double (SSE2) ====================

    /// MOVSD xmm, [base + disp]
    pub fn movsd_xmm_mem(&mut self, dst: Xmm, base: Reg64, disp: i32) {
        self.emit_sse_mem(0xF2, 0x10, dst, base, disp); // F2 0F 10 /r
    }

    /// MOVSD [base + disp], xmm
    pub fn movsd_mem_xmm(&mut self, base: Reg64, disp: i32, src: Xmm) {
        self.emit_sse_mem(0xF2, 0x11, src, base, disp); // F2 0F 11 /r
    }

    /// MOVSD xmm, xmm
    pub fn movsd_xmm_xmm(&mut self, dst: Xmm, src: Xmm) {
        self.emit_sse_rr(0xF2, 0x10, dst, src);
    }

    /// MOVSD xmm, [rip + disp32]
    pub fn movsd_xmm_rip(&mut self, dst: Xmm) -> usize {
        self.emit_sse_rip(0xF2, 0x10, dst)
    }

    /// MOVSD [rip + disp32], xmm
    pub fn movsd_rip_xmm(&mut self, src: Xmm) -> usize {
        self.emit_sse_rip(0xF2, 0x11, src)
    }

    /// ADDSD xmm, xmm
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit_sse_rr(0xF2, 0x58, dst, src); // F2 0F 58 /r
    }

    /// SUBSD xmm, xmm
    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit_sse_rr(0xF2, 0x5C, dst, src); // F2 0F 5C /r
    }

    /// MULSD xmm, xmm
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit_sse_rr(0xF2, 0x59, dst, src); // F2 0F 59 /r
    }

    /// DIVSD xmm, xmm
    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit_sse_rr(0xF2, 0x5E, dst, src); // F2 0F 5E /r
    }

    /// UCOMISD xmm, xmm (sets ZF/PF/CF)
    pub fn ucomisd(&mut self, left: Xmm, right: Xmm) {
        self.emit_sse_rr(0x66, 0x2E, left, right); // 66 0F 2E /r
    }

    /// XORPD xmm, xmm
    pub fn xorpd(&mut self, dst: Xmm, src: Xmm) {
        self.emit_sse_rr(0x66, 0x57, dst, src); // 66 0F 57 /r
    }

    /// CVTSI2SD xmm, r64
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg64) {
        // F2 REX.W 0F 2A /r
        self.emit_sse_gpr(
            0xF2,
            0x2A,
            dst.encoding(),
            dst.needs_rex_ext(),
            src.encoding(),
            src.needs_rex_ext(),
        );
    }

    /// CVTTSD2SI r64, xmm (truncating)
    pub fn cvttsd2si(&mut self, dst: Reg64, src: Xmm) {
        // F2 REX.W 0F 2C /r
        self.emit_sse_gpr(
            0xF2,
            0x2C,
            dst.encoding(),
            dst.needs_rex_ext(),
            src.encoding(),
            src.needs_rex_ext(),
        );
    }

    /// MOVQ xmm, r64 (raw bits)
    pub fn movq_xmm_r64(&mut self, dst: Xmm, src: Reg64) {
        // 66 REX.W 0F 6E /r
        self.emit_sse_gpr(
            0x66,
            0x6E,
            dst.encoding(),
            dst.needs_rex_ext(),
            src.encoding(),
            src.needs_rex_ext(),
        );
    }

    /// MOVQ r64, xmm (raw bits)
    pub fn movq_r64_xmm(&mut self, dst: Reg64, src: Xmm) {
        // 66 REX.W 0F 7E /r
        self.emit_sse_gpr(
            0x66,
            0x7E,
            src.encoding(),
            src.needs_rex_ext(),
            dst.encoding(),
            dst.needs_rex_ext(),
        );
    }
}
