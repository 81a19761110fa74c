//! Runtime helpers emitted on demand
//!
//! Generated programs link against nothing. Printing, string concatenation,
//! string comparison and allocation are small hand-written routines appended
//! after user code, each emitted at most once and only when something calls
//! it. A helper may request another (concatenation allocates, printing a
//! float prints its integer part), so emission runs until the request list
//! stops growing.
//!
//! Calling convention inside the helpers:
//!
//! | Helper       | Inputs                                  | Output          |
//! |--------------|-----------------------------------------|-----------------|
//! | `write_int`  | RDI = value                             |                 |
//! | `print_int`  | RDI = value                             |                 |
//! | `print_float`| XMM0 = value                            |                 |
//! | `print_text` | RDI = ptr, RSI = len                    |                 |
//! | `alloc`      | RDI = size                              | RAX = ptr       |
//! | `concat`     | RDI/RSI = left ptr/len, RDX/RCX = right | RAX/RBX = text  |
//! | `text_eq`    | RDI/RSI = left ptr/len, RDX/RCX = right | RAX = 0 or 1    |

use std::fmt;

use tracing::trace;

use crate::error::Result;

use super::super::encoding::Cond;
use super::super::registers::{Reg64, Xmm, TEXT_LEN_REG};
use super::super::tables::{Label, LabelTable, NEWLINE_OFFSET};
use super::{syscall, X64Codegen};

/// Scale applied to the fractional part when printing doubles
const FRACTION_SCALE: i32 = 1_000_000;
const FRACTION_DIGITS: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// Decimal digits of a signed integer, no newline
    WriteInt,
    PrintInt,
    PrintFloat,
    PrintText,
    Alloc,
    Concat,
    TextEq,
}

impl fmt::Display for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Helper::WriteInt => "write_int",
            Helper::PrintInt => "print_int",
            Helper::PrintFloat => "print_float",
            Helper::PrintText => "print_text",
            Helper::Alloc => "alloc",
            Helper::Concat => "concat",
            Helper::TextEq => "text_eq",
        };
        write!(f, "{}", name)
    }
}

/// Helpers requested so far, in request order
#[derive(Debug, Default)]
pub struct RuntimeHelpers {
    requested: Vec<(Helper, Label)>,
}

impl RuntimeHelpers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label of `helper`, allocating one on first request
    pub fn label(&mut self, helper: Helper, labels: &mut LabelTable) -> Label {
        if let Some(&(_, label)) = self.requested.iter().find(|(h, _)| *h == helper) {
            return label;
        }
        let label = labels.new_label();
        self.requested.push((helper, label));
        label
    }

    pub fn is_requested(&self, helper: Helper) -> bool {
        self.requested.iter().any(|(h, _)| *h == helper)
    }

    pub fn len(&self) -> usize {
        self.requested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}

impl X64Codegen<'_> {
    /// Emit every requested helper, including ones requested by helpers
    pub(super) fn emit_runtime(&mut self) -> Result<()> {
        let mut next = 0;
        while let Some(&(helper, label)) = self.helpers.requested.get(next) {
            self.bind(label)?;
            let start = self.code.offset();
            match helper {
                Helper::WriteInt => self.emit_write_int()?,
                Helper::PrintInt => self.emit_print_int(),
                Helper::PrintFloat => self.emit_print_float()?,
                Helper::PrintText => self.emit_print_text(),
                Helper::Alloc => self.emit_alloc()?,
                Helper::Concat => self.emit_concat(),
                Helper::TextEq => self.emit_text_eq()?,
            }
            trace!(
                %helper,
                %label,
                start,
                size = self.code.offset() - start,
                "emitted runtime helper"
            );
            next += 1;
        }
        Ok(())
    }

    /// write(1, rsi, rdx)
    fn emit_sys_write(&mut self) {
        self.code.mov_r64_imm32(Reg64::RAX, syscall::SYS_WRITE);
        self.code.mov_r64_imm32(Reg64::RDI, syscall::STDOUT);
        self.code.syscall();
    }

    fn emit_newline(&mut self) {
        let site = self.code.lea_r64_rip(Reg64::RSI);
        self.rip_const(site, NEWLINE_OFFSET);
        self.code.mov_r64_imm32(Reg64::RDX, 1);
        self.emit_sys_write();
    }

    /// Digits are produced least significant first, right to left below RBP.
    /// Remainders are made non-negative per digit so i64::MIN prints correctly.
    fn emit_write_int(&mut self) -> Result<()> {
        let digit = self.labels.new_label();
        let positive = self.labels.new_label();
        let unsigned = self.labels.new_label();

        self.code.push_r64(Reg64::RBP);
        self.code.mov_r64_r64(Reg64::RBP, Reg64::RSP);
        self.code.sub_r64_imm32(Reg64::RSP, 32);
        self.code.mov_r64_r64(Reg64::RAX, Reg64::RDI);
        self.code.mov_r64_r64(Reg64::R8, Reg64::RDI);
        self.code.mov_r64_imm32(Reg64::RCX, 10);
        self.code.mov_r64_r64(Reg64::RSI, Reg64::RBP);

        self.bind(digit)?;
        self.code.cqo();
        self.code.idiv_r64(Reg64::RCX);
        self.code.test_r64_r64(Reg64::RDX, Reg64::RDX);
        self.jump_if(Cond::NS, positive);
        self.code.neg_r64(Reg64::RDX);
        self.bind(positive)?;
        self.code.add_r64_imm32(Reg64::RDX, b'0' as i32);
        self.code.dec_r64(Reg64::RSI);
        self.code.mov_mem_r8(Reg64::RSI, 0, Reg64::RDX);
        self.code.test_r64_r64(Reg64::RAX, Reg64::RAX);
        self.jump_if(Cond::NE, digit);

        self.code.test_r64_r64(Reg64::R8, Reg64::R8);
        self.jump_if(Cond::NS, unsigned);
        self.code.dec_r64(Reg64::RSI);
        self.code.mov_r64_imm32(Reg64::RDX, b'-' as i32);
        self.code.mov_mem_r8(Reg64::RSI, 0, Reg64::RDX);
        self.bind(unsigned)?;

        self.code.mov_r64_r64(Reg64::RDX, Reg64::RBP);
        self.code.sub_r64_r64(Reg64::RDX, Reg64::RSI);
        self.emit_sys_write();
        self.code.leave();
        self.code.ret();
        Ok(())
    }

    fn emit_print_int(&mut self) {
        self.call_helper(Helper::WriteInt);
        self.emit_newline();
        self.code.ret();
    }

    fn emit_print_text(&mut self) {
        self.code.mov_r64_r64(Reg64::RDX, Reg64::RSI);
        self.code.mov_r64_r64(Reg64::RSI, Reg64::RDI);
        self.emit_sys_write();
        self.emit_newline();
        self.code.ret();
    }

    /// Anonymous private read/write mapping; a zero-byte request maps one byte
    fn emit_alloc(&mut self) -> Result<()> {
        let sized = self.labels.new_label();
        self.code.mov_r64_r64(Reg64::RSI, Reg64::RDI);
        self.code.test_r64_r64(Reg64::RSI, Reg64::RSI);
        self.jump_if(Cond::NE, sized);
        self.code.inc_r64(Reg64::RSI);
        self.bind(sized)?;
        self.code.xor_r64_r64(Reg64::RDI, Reg64::RDI);
        self.code.mov_r64_imm32(Reg64::RDX, syscall::PROT_READ_WRITE);
        self.code.mov_r64_imm32(Reg64::R10, syscall::MAP_PRIVATE_ANONYMOUS);
        self.code.mov_r64_imm32(Reg64::R8, -1);
        self.code.xor_r64_r64(Reg64::R9, Reg64::R9);
        self.code.mov_r64_imm32(Reg64::RAX, syscall::SYS_MMAP);
        self.code.syscall();
        self.code.ret();
        Ok(())
    }

    fn emit_concat(&mut self) {
        // [rbp-8] left ptr, [rbp-16] left len, [rbp-24] right ptr, [rbp-32] right len,
        // [rbp-40] result
        self.code.push_r64(Reg64::RBP);
        self.code.mov_r64_r64(Reg64::RBP, Reg64::RSP);
        self.code.push_r64(Reg64::RDI);
        self.code.push_r64(Reg64::RSI);
        self.code.push_r64(Reg64::RDX);
        self.code.push_r64(Reg64::RCX);

        self.code.mov_r64_r64(Reg64::RDI, Reg64::RSI);
        self.code.add_r64_r64(Reg64::RDI, Reg64::RCX);
        self.call_helper(Helper::Alloc);
        self.code.push_r64(Reg64::RAX);

        self.code.mov_r64_r64(Reg64::RDI, Reg64::RAX);
        self.code.mov_r64_mem(Reg64::RSI, Reg64::RBP, -8);
        self.code.mov_r64_mem(Reg64::RCX, Reg64::RBP, -16);
        self.code.rep_movsb();
        self.code.mov_r64_mem(Reg64::RSI, Reg64::RBP, -24);
        self.code.mov_r64_mem(Reg64::RCX, Reg64::RBP, -32);
        self.code.rep_movsb();

        self.code.mov_r64_mem(Reg64::RAX, Reg64::RBP, -40);
        self.code.mov_r64_mem(TEXT_LEN_REG, Reg64::RBP, -16);
        self.code.mov_r64_mem(Reg64::RCX, Reg64::RBP, -32);
        self.code.add_r64_r64(TEXT_LEN_REG, Reg64::RCX);
        self.code.leave();
        self.code.ret();
    }

    fn emit_text_eq(&mut self) -> Result<()> {
        let equal = self.labels.new_label();
        let done = self.labels.new_label();

        self.code.xor_r64_r64(Reg64::RAX, Reg64::RAX);
        self.code.cmp_r64_r64(Reg64::RSI, Reg64::RCX);
        self.jump_if(Cond::NE, done);
        self.code.mov_r64_r64(Reg64::RSI, Reg64::RDI);
        self.code.mov_r64_r64(Reg64::RDI, Reg64::RDX);
        self.code.test_r64_r64(Reg64::RCX, Reg64::RCX);
        self.jump_if(Cond::E, equal);
        self.code.repe_cmpsb();
        self.jump_if(Cond::NE, done);
        self.bind(equal)?;
        self.code.mov_r64_imm32(Reg64::RAX, 1);
        self.bind(done)?;
        self.code.ret();
        Ok(())
    }

    /// `[-]int.frac` with six fractional digits rounded, trailing zeros
    /// trimmed down to one
    fn emit_print_float(&mut self) -> Result<()> {
        // [rbp-8] |value|, [rbp-16] sign byte, [rbp-24] integer part,
        // [rbp-32] scaled fraction, [rbp-47] '.', [rbp-46..rbp-41] digits
        let positive = self.labels.new_label();
        let no_carry = self.labels.new_label();
        let digit = self.labels.new_label();
        let trim = self.labels.new_label();
        let trimmed = self.labels.new_label();

        self.code.push_r64(Reg64::RBP);
        self.code.mov_r64_r64(Reg64::RBP, Reg64::RSP);
        self.code.sub_r64_imm32(Reg64::RSP, 64);
        self.code.movsd_mem_xmm(Reg64::RBP, -8, Xmm::XMM0);

        self.code.xorpd(Xmm::XMM1, Xmm::XMM1);
        self.code.ucomisd(Xmm::XMM0, Xmm::XMM1);
        self.jump_if(Cond::AE, positive);
        self.code.mov_r64_imm32(Reg64::RAX, b'-' as i32);
        self.code.mov_mem_r8(Reg64::RBP, -16, Reg64::RAX);
        self.code.lea_r64_mem(Reg64::RSI, Reg64::RBP, -16);
        self.code.mov_r64_imm32(Reg64::RDX, 1);
        self.emit_sys_write();
        self.code.movsd_xmm_mem(Xmm::XMM1, Reg64::RBP, -8);
        self.code.xorpd(Xmm::XMM0, Xmm::XMM0);
        self.code.subsd(Xmm::XMM0, Xmm::XMM1);
        self.code.movsd_mem_xmm(Reg64::RBP, -8, Xmm::XMM0);
        self.bind(positive)?;

        // Integer part and rounded, scaled fraction
        self.code.movsd_xmm_mem(Xmm::XMM0, Reg64::RBP, -8);
        self.code.cvttsd2si(Reg64::RAX, Xmm::XMM0);
        self.code.mov_mem_r64(Reg64::RBP, -24, Reg64::RAX);
        self.code.cvtsi2sd(Xmm::XMM1, Reg64::RAX);
        self.code.subsd(Xmm::XMM0, Xmm::XMM1);
        let scale = self.pool.intern_f64(FRACTION_SCALE as f64);
        let site = self.code.movsd_xmm_rip(Xmm::XMM1);
        self.rip_const(site, scale);
        self.code.mulsd(Xmm::XMM0, Xmm::XMM1);
        let half = self.pool.intern_f64(0.5);
        let site = self.code.movsd_xmm_rip(Xmm::XMM1);
        self.rip_const(site, half);
        self.code.addsd(Xmm::XMM0, Xmm::XMM1);
        self.code.cvttsd2si(Reg64::RCX, Xmm::XMM0);

        // Rounding up to 1.0 carries into the integer part
        self.code.cmp_r64_imm32(Reg64::RCX, FRACTION_SCALE);
        self.jump_if(Cond::L, no_carry);
        self.code.sub_r64_imm32(Reg64::RCX, FRACTION_SCALE);
        self.code.mov_r64_mem(Reg64::RAX, Reg64::RBP, -24);
        self.code.inc_r64(Reg64::RAX);
        self.code.mov_mem_r64(Reg64::RBP, -24, Reg64::RAX);
        self.bind(no_carry)?;
        self.code.mov_mem_r64(Reg64::RBP, -32, Reg64::RCX);

        self.code.mov_r64_mem(Reg64::RDI, Reg64::RBP, -24);
        self.call_helper(Helper::WriteInt);

        // Six zero-padded fraction digits
        self.code.mov_r64_mem(Reg64::RAX, Reg64::RBP, -32);
        self.code.lea_r64_mem(Reg64::RSI, Reg64::RBP, -40);
        self.code.mov_r64_imm32(Reg64::RCX, 10);
        self.code.mov_r64_imm32(Reg64::R8, FRACTION_DIGITS);
        self.bind(digit)?;
        self.code.cqo();
        self.code.idiv_r64(Reg64::RCX);
        self.code.add_r64_imm32(Reg64::RDX, b'0' as i32);
        self.code.dec_r64(Reg64::RSI);
        self.code.mov_mem_r8(Reg64::RSI, 0, Reg64::RDX);
        self.code.dec_r64(Reg64::R8);
        self.jump_if(Cond::NE, digit);

        // Drop trailing zeros, keeping at least one digit
        self.code.mov_r64_imm32(Reg64::RDX, FRACTION_DIGITS);
        self.bind(trim)?;
        self.code.cmp_r64_imm32(Reg64::RDX, 1);
        self.jump_if(Cond::LE, trimmed);
        self.code.lea_r64_mem(Reg64::RAX, Reg64::RBP, -47);
        self.code.add_r64_r64(Reg64::RAX, Reg64::RDX);
        self.code.cmp_mem8_imm8(Reg64::RAX, 0, b'0');
        self.jump_if(Cond::NE, trimmed);
        self.code.dec_r64(Reg64::RDX);
        self.jump(trim);
        self.bind(trimmed)?;

        self.code.mov_r64_imm32(Reg64::RAX, b'.' as i32);
        self.code.mov_mem_r8(Reg64::RBP, -47, Reg64::RAX);
        self.code.lea_r64_mem(Reg64::RSI, Reg64::RBP, -47);
        self.code.inc_r64(Reg64::RDX);
        self.emit_sys_write();
        self.emit_newline();
        self.code.leave();
        self.code.ret();
        Ok(())
    }
}
