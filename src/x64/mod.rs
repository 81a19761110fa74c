//! x64 Native Code Generation Backend
//!
//! Direct x64 machine code generation without an external assembler or
//! linker.
//!
//! ## Architecture
//!
//! ```text
//! Program → X64Codegen → MachineCode → Elf64Builder → Native Executable
//! ```
//!
//! ## Modules
//!
//! - `registers`: x64 register definitions and encoding
//! - `encoding`: code buffer and instruction encoding (REX, ModR/M, SIB)
//! - `tables`: labels, patch sites, constant pool, globals, functions
//! - `codegen`: typed AST to x64 translation and runtime helpers
//! - `elf`: ELF64 executable generation (Linux)

pub mod codegen;
pub mod elf;
pub mod encoding;
pub mod registers;
pub mod tables;

pub use codegen::{MachineCode, X64Codegen};
pub use elf::{Elf64Builder, SegmentLayout};
