//! x64 Register Definitions
//!
//! The 16 general-purpose 64-bit registers and the 16 SSE registers,
//! with their encoding values. Follows the System V AMD64 ABI for Linux.

use std::fmt;

/// x64 64-bit general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg64 {
    /// Get the 3-bit encoding for ModR/M and SIB bytes
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// Check if this register requires REX.B or REX.R bit
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Byte access to SPL/BPL/SIL/DIL requires a REX prefix,
    /// otherwise the encoding selects AH/CH/DH/BH.
    #[inline]
    pub fn needs_rex_for_byte(self) -> bool {
        (4..8).contains(&(self as u8))
    }

    /// Memory operand with this base needs a SIB byte (RSP, R12)
    #[inline]
    pub fn needs_sib(self) -> bool {
        self.encoding() == 0b100
    }

    /// Memory operand with this base cannot use mod=00 (RBP, R13)
    #[inline]
    pub fn needs_disp(self) -> bool {
        self.encoding() == 0b101
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
            Reg64::R8 => "r8",
            Reg64::R9 => "r9",
            Reg64::R10 => "r10",
            Reg64::R11 => "r11",
            Reg64::R12 => "r12",
            Reg64::R13 => "r13",
            Reg64::R14 => "r14",
            Reg64::R15 => "r15",
        };
        write!(f, "{}", name)
    }
}

/// SSE register used for scalar doubles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

impl Xmm {
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", *self as u8)
    }
}

/// System V AMD64 ABI argument registers (in order) - Linux
pub const SYSV_ARG_REGS: [Reg64; 6] = [
    Reg64::RDI,
    Reg64::RSI,
    Reg64::RDX,
    Reg64::RCX,
    Reg64::R8,
    Reg64::R9,
];

/// System V AMD64 ABI return register
pub const SYSV_RET_REG: Reg64 = Reg64::RAX;

/// Second half of a text value (byte length)
pub const TEXT_LEN_REG: Reg64 = Reg64::RBX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        assert_eq!(Reg64::RAX.encoding(), 0);
        assert_eq!(Reg64::RCX.encoding(), 1);
        assert_eq!(Reg64::R8.encoding(), 0);
        assert_eq!(Reg64::R15.encoding(), 7);
        assert_eq!(Xmm::XMM9.encoding(), 1);
    }

    #[test]
    fn test_rex_extension() {
        assert!(!Reg64::RAX.needs_rex_ext());
        assert!(!Reg64::RDI.needs_rex_ext());
        assert!(Reg64::R8.needs_rex_ext());
        assert!(Reg64::R15.needs_rex_ext());
        assert!(Xmm::XMM8.needs_rex_ext());
        assert!(!Xmm::XMM7.needs_rex_ext());
    }

    #[test]
    fn test_memory_base_quirks() {
        assert!(Reg64::RSP.needs_sib());
        assert!(Reg64::R12.needs_sib());
        assert!(!Reg64::RBP.needs_sib());
        assert!(Reg64::RBP.needs_disp());
        assert!(Reg64::R13.needs_disp());
        assert!(!Reg64::RAX.needs_disp());
    }

    #[test]
    fn test_byte_registers() {
        assert!(Reg64::RSI.needs_rex_for_byte());
        assert!(Reg64::RSP.needs_rex_for_byte());
        assert!(!Reg64::RAX.needs_rex_for_byte());
        assert!(!Reg64::R8.needs_rex_for_byte());
    }

    #[test]
    fn test_display() {
        assert_eq!(Reg64::R12.to_string(), "r12");
        assert_eq!(Xmm::XMM3.to_string(), "xmm3");
    }
}
