//! # elfc
//!
//! Native backend that turns a typed program into a standalone x86-64 Linux
//! executable. No assembler, no linker, no libc: machine code is encoded
//! directly and wrapped in a minimal static ELF64 image.
//!
//! ## Pipeline
//!
//! | Stage      | Module            | Output                         |
//! |------------|-------------------|--------------------------------|
//! | Generate   | `x64::codegen`    | code, rodata, globals, patches |
//! | Link       | `x64::elf`        | laid-out segments, RIP fixups  |
//! | Write      | `x64::elf`        | executable file (mode 0755)    |
//!
//! ```no_run
//! use elfc::ast::{Expr, Program, Stmt};
//!
//! let mut program = Program::new();
//! program.items.push(Stmt::print(Expr::int(42)));
//! elfc::compile_to_file(&program, std::path::Path::new("answer")).unwrap();
//! ```

pub mod ast;
pub mod error;
pub mod x64;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

pub use ast::Program;
pub use error::{CompileError, ErrorCode, Result};
pub use x64::{Elf64Builder, SegmentLayout, X64Codegen};

/// Output formats a backend can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Static x86-64 Linux executable
    Elf64,
}

impl FromStr for Target {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "elf64" | "elf" | "x86_64-linux" => Ok(Target::Elf64),
            other => Err(CompileError::InvalidInput {
                message: format!(
                    "target '{}' is not provided by this backend (available: elf64)",
                    other
                ),
            }),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Elf64 => write!(f, "elf64"),
        }
    }
}

fn builder_for(program: &Program) -> Result<Elf64Builder> {
    Ok(X64Codegen::new(program).generate()?.into_elf())
}

/// Compile a program to the bytes of an ELF64 executable
pub fn compile_program(program: &Program) -> Result<Vec<u8>> {
    builder_for(program)?.build()
}

/// Compile a program and write it as an executable file
///
/// Nothing is created unless compilation succeeds.
pub fn compile_to_file(program: &Program, path: &Path) -> Result<()> {
    let image = compile_program(program)?;
    x64::elf::write_executable(path, &image)?;
    info!(path = %path.display(), bytes = image.len(), "wrote executable");
    Ok(())
}

/// Segment placement the executable for `program` would get
pub fn layout_program(program: &Program) -> Result<SegmentLayout> {
    Ok(builder_for(program)?.layout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Stmt};

    #[test]
    fn test_target_parsing() {
        assert_eq!("elf64".parse::<Target>().unwrap(), Target::Elf64);
        assert_eq!("ELF64".parse::<Target>().unwrap(), Target::Elf64);
        let err = "wasm".parse::<Target>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::E902);
        assert!(err.to_string().contains("wasm"));
    }

    #[test]
    fn test_compile_program_produces_elf() {
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::int(5)));
        let image = compile_program(&program).unwrap();
        assert_eq!(&image[..4], b"\x7fELF");
        let layout = layout_program(&program).unwrap();
        assert_eq!(image.len() as u64, layout.file_size());
        assert_eq!(layout.entry, layout.code_vaddr);
    }

    #[test]
    fn test_failed_compile_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::call("missing", vec![], ast::ValueType::Int)));
        assert!(compile_to_file(&program, &path).is_err());
        assert!(!path.exists());
    }
}
