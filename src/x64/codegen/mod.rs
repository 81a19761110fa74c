//! Typed AST to x64 Code Generation
//!
//! A single depth-first walk over the typed program that emits machine code
//! through [`CodeBuffer`] and keeps the label, constant, global and function
//! tables up to date.
//!
//! ## Value convention
//!
//! | Type        | Result registers              |
//! |-------------|-------------------------------|
//! | int, bool   | RAX                           |
//! | float       | XMM0                          |
//! | text        | RAX = pointer, RBX = length   |
//!
//! ## Calls
//!
//! Arguments are evaluated right to left and pushed, then the first six
//! argument words are popped into RDI, RSI, RDX, RCX, R8, R9 (a text argument
//! takes two words, a float travels as its raw bits). Remaining words stay on
//! the stack where the callee finds them at `[rbp + 16 + 8k]`.

mod expr;
mod frame;
mod runtime;
mod stmt;

use tracing::{debug, trace};

use crate::ast::{Program, Span, Stmt, StmtKind, Storage, Symbol, SymbolId, ValueType};
use crate::error::{CompileError, Result};

use super::elf::Elf64Builder;
use super::encoding::{Cond, CodeBuffer};
use super::registers::{Reg64, Xmm, SYSV_ARG_REGS, SYSV_RET_REG, TEXT_LEN_REG};
use super::tables::{
    ConstantPool, FunctionEntry, FunctionTable, GlobalTable, Label, LabelTable, RipPatch,
    RipTarget,
};

pub use frame::FrameLayout;
pub use runtime::{Helper, RuntimeHelpers};

/// Linux x86-64 syscall numbers and flags
pub mod syscall {
    pub const SYS_WRITE: i32 = 1;
    pub const SYS_MMAP: i32 = 9;
    pub const SYS_EXIT_GROUP: i32 = 231;

    // File descriptors
    pub const STDOUT: i32 = 1;

    // mmap
    pub const PROT_READ_WRITE: i32 = 0x3;
    pub const MAP_PRIVATE_ANONYMOUS: i32 = 0x22;
}

/// Output of code generation, ready for the ELF writer
#[derive(Debug)]
pub struct MachineCode {
    pub code: Vec<u8>,
    pub rodata: Vec<u8>,
    pub globals: GlobalTable,
    pub rip_patches: Vec<RipPatch>,
    pub entry_offset: usize,
}

impl MachineCode {
    /// Hand the generated parts to the ELF writer
    pub fn into_elf(self) -> Elf64Builder {
        Elf64Builder::new()
            .code(self.code)
            .rodata(self.rodata)
            .globals(self.globals)
            .rip_patches(self.rip_patches)
            .entry_offset(self.entry_offset as u64)
    }
}

/// Break/continue targets of one enclosing loop
#[derive(Debug, Clone)]
struct LoopLabels {
    name: Option<String>,
    continue_to: Label,
    exit: Label,
}

/// State that lives for one function body
#[derive(Debug)]
struct FunctionState {
    frame: FrameLayout,
    loops: Vec<LoopLabels>,
    epilogue: Label,
    ret: ValueType,
}

/// x64 code generator
pub struct X64Codegen<'a> {
    program: &'a Program,
    code: CodeBuffer,
    labels: LabelTable,
    pool: ConstantPool,
    globals: GlobalTable,
    functions: FunctionTable,
    rip_patches: Vec<RipPatch>,
    helpers: RuntimeHelpers,
    func: Option<FunctionState>,
}

impl<'a> X64Codegen<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            code: CodeBuffer::with_capacity(4096),
            labels: LabelTable::new(),
            pool: ConstantPool::new(),
            globals: GlobalTable::new(),
            functions: FunctionTable::new(),
            rip_patches: Vec::new(),
            helpers: RuntimeHelpers::new(),
            func: None,
        }
    }

    /// Generate the whole program: entry stub, entry body, functions, helpers
    pub fn generate(mut self) -> Result<MachineCode> {
        let program = self.program;
        self.register_globals()?;
        self.register_functions()?;

        let entry_body = self.labels.new_label();
        let entry_offset = self.emit_start(entry_body)?;
        self.gen_entry_body(entry_body)?;

        for stmt in &program.items {
            if let StmtKind::Function(decl) = &stmt.kind {
                let label = self
                    .functions
                    .get(&decl.name)
                    .map(|f| f.label)
                    .ok_or_else(|| {
                        CompileError::internal(format!("function '{}' not registered", decl.name))
                    })?;
                self.begin_function(&decl.name, label, &decl.params, decl.ret, &decl.body)?;
                self.gen_block(&decl.body)?;
                self.end_function(&decl.name)?;
            }
        }

        self.emit_runtime()?;

        let patched = self.labels.resolve(&mut self.code)?;
        debug!(
            code_size = self.code.offset(),
            rodata_size = self.pool.len(),
            labels = self.labels.len(),
            patched,
            rip_patches = self.rip_patches.len(),
            "generated machine code"
        );

        Ok(MachineCode {
            code: self.code.into_code(),
            rodata: self.pool.into_bytes(),
            globals: self.globals,
            rip_patches: self.rip_patches,
            entry_offset,
        })
    }

    /// Lay out globals in index order; indices must be dense
    fn register_globals(&mut self) -> Result<()> {
        let program = self.program;
        let mut globals: Vec<(u32, &Symbol)> = program
            .symbols
            .iter()
            .filter_map(|s| match s.storage {
                Storage::Global { index } => Some((index, s)),
                Storage::Local { .. } => None,
            })
            .collect();
        globals.sort_by_key(|(index, _)| *index);

        for (expected, (index, symbol)) in globals.into_iter().enumerate() {
            if index as usize != expected {
                return Err(CompileError::InvalidInput {
                    message: format!(
                        "global '{}' has index {}, expected {}",
                        symbol.name, index, expected
                    ),
                });
            }
            self.globals.add(&symbol.name, GlobalTable::size_for(symbol.ty));
        }
        Ok(())
    }

    /// Pre-scan top-level functions so calls may precede definitions
    fn register_functions(&mut self) -> Result<()> {
        let program = self.program;
        for stmt in &program.items {
            if let StmtKind::Function(decl) = &stmt.kind {
                let mut params = Vec::with_capacity(decl.params.len());
                for &param in &decl.params {
                    let symbol = self.symbol(param)?;
                    let is_local = matches!(symbol.storage, Storage::Local { .. });
                    if symbol.ty == ValueType::Void || !is_local {
                        return Err(CompileError::InvalidInput {
                            message: format!(
                                "parameter '{}' of '{}' must be a typed local",
                                symbol.name, decl.name
                            ),
                        });
                    }
                    params.push(symbol.ty);
                }
                let entry = FunctionEntry {
                    label: self.labels.new_label(),
                    params,
                    ret: decl.ret,
                };
                self.functions.register(&decl.name, entry)?;
            }
        }
        trace!(functions = self.functions.len(), "registered functions");
        Ok(())
    }

    /// Process entry: argc/argv, align the stack, run the entry body, exit_group
    fn emit_start(&mut self, entry_body: Label) -> Result<usize> {
        let offset = self.code.offset();
        self.code.pop_r64(Reg64::RDI); // argc
        self.code.mov_r64_r64(Reg64::RSI, Reg64::RSP); // argv
        self.code.and_r64_imm32(Reg64::RSP, -16);
        self.call_label(entry_body);
        self.code.mov_r64_r64(Reg64::RDI, SYSV_RET_REG);
        self.code.mov_r64_imm32(Reg64::RAX, syscall::SYS_EXIT_GROUP);
        self.code.syscall();
        Ok(offset)
    }

    /// Top-level statements form an implicit function returning the exit code
    fn gen_entry_body(&mut self, label: Label) -> Result<()> {
        let program = self.program;
        self.begin_function("<entry>", label, &[], ValueType::Int, &program.items)?;
        for stmt in &program.items {
            if !matches!(stmt.kind, StmtKind::Function(_)) {
                self.gen_stmt(stmt)?;
            }
        }
        self.end_function("<entry>")
    }

    fn begin_function(
        &mut self,
        name: &str,
        label: Label,
        params: &[SymbolId],
        ret: ValueType,
        body: &[Stmt],
    ) -> Result<()> {
        let frame = FrameLayout::for_function(self.program, params, body)?;
        debug!(function = name, frame_size = frame.size(), "generating function");

        self.bind(label)?;
        self.code.push_r64(Reg64::RBP);
        self.code.mov_r64_r64(Reg64::RBP, Reg64::RSP);
        if frame.size() > 0 {
            self.code.sub_r64_imm32(Reg64::RSP, frame.size());
        }

        // Spill incoming argument words into their frame slots
        let mut word = 0usize;
        for &param in params {
            let symbol = self.symbol(param)?;
            let Storage::Local { slot } = symbol.storage else {
                return Err(CompileError::internal("global parameter slipped through registration"));
            };
            let base = FrameLayout::slot_disp(slot);
            for part in 0..symbol.ty.words() as i32 {
                let dest = base - 8 * part;
                match SYSV_ARG_REGS.get(word) {
                    Some(&reg) => self.code.mov_mem_r64(Reg64::RBP, dest, reg),
                    None => {
                        let incoming = 16 + 8 * (word - SYSV_ARG_REGS.len()) as i32;
                        self.code.mov_r64_mem(Reg64::RAX, Reg64::RBP, incoming);
                        self.code.mov_mem_r64(Reg64::RBP, dest, Reg64::RAX);
                    }
                }
                word += 1;
            }
        }

        let epilogue = self.labels.new_label();
        self.func = Some(FunctionState {
            frame,
            loops: Vec::new(),
            epilogue,
            ret,
        });
        Ok(())
    }

    fn end_function(&mut self, name: &str) -> Result<()> {
        let state = self
            .func
            .take()
            .ok_or_else(|| CompileError::internal("end_function without begin_function"))?;
        // Falling off the end returns zero
        self.zero_value(state.ret);
        self.bind(state.epilogue)?;
        self.code.leave();
        self.code.ret();
        trace!(function = name, end = self.code.offset(), "function done");
        Ok(())
    }

    fn func(&mut self) -> Result<&mut FunctionState> {
        self.func
            .as_mut()
            .ok_or_else(|| CompileError::internal("statement generated outside of a function"))
    }

    // ==================== Labels & Patches ====================

    fn bind(&mut self, label: Label) -> Result<()> {
        self.labels.fix(label, self.code.offset())
    }

    fn jump(&mut self, label: Label) {
        let site = self.code.jmp_rel32();
        self.labels.add_patch(site, label);
    }

    fn jump_if(&mut self, cond: Cond, label: Label) {
        let site = self.code.jcc_rel32(cond);
        self.labels.add_patch(site, label);
    }

    fn call_label(&mut self, label: Label) {
        let site = self.code.call_rel32();
        self.labels.add_patch(site, label);
    }

    fn call_helper(&mut self, helper: Helper) {
        let label = self.helpers.label(helper, &mut self.labels);
        self.call_label(label);
    }

    fn rip_const(&mut self, site: usize, offset: usize) {
        self.rip_patches.push(RipPatch {
            site,
            target: RipTarget::Const { offset },
        });
    }

    fn rip_global(&mut self, site: usize, index: usize, extra: usize) {
        self.rip_patches.push(RipPatch {
            site,
            target: RipTarget::Global { index, extra },
        });
    }

    // ==================== Symbols ====================

    fn symbol(&self, id: SymbolId) -> Result<&'a Symbol> {
        let program = self.program;
        program.symbol(id).ok_or_else(|| CompileError::InvalidInput {
            message: format!("reference to undeclared symbol #{}", id.0),
        })
    }

    /// Load a variable into the result registers for its type
    fn load_symbol(&mut self, id: SymbolId, span: Span) -> Result<ValueType> {
        let symbol = self.symbol(id)?;
        match (symbol.storage, symbol.ty) {
            (_, ValueType::Void) => {
                return Err(CompileError::VoidVariable {
                    name: symbol.name.clone(),
                    span,
                })
            }
            (Storage::Local { slot }, ty) => {
                let disp = FrameLayout::slot_disp(slot);
                match ty {
                    ValueType::Float => self.code.movsd_xmm_mem(Xmm::XMM0, Reg64::RBP, disp),
                    ValueType::Text => {
                        self.code.mov_r64_mem(Reg64::RAX, Reg64::RBP, disp);
                        self.code.mov_r64_mem(TEXT_LEN_REG, Reg64::RBP, disp - 8);
                    }
                    _ => self.code.mov_r64_mem(Reg64::RAX, Reg64::RBP, disp),
                }
            }
            (Storage::Global { index }, ty) => {
                let index = index as usize;
                match ty {
                    ValueType::Float => {
                        let site = self.code.movsd_xmm_rip(Xmm::XMM0);
                        self.rip_global(site, index, 0);
                    }
                    ValueType::Text => {
                        let site = self.code.mov_r64_rip(Reg64::RAX);
                        self.rip_global(site, index, 0);
                        let site = self.code.mov_r64_rip(TEXT_LEN_REG);
                        self.rip_global(site, index, 8);
                    }
                    _ => {
                        let site = self.code.mov_r64_rip(Reg64::RAX);
                        self.rip_global(site, index, 0);
                    }
                }
            }
        }
        Ok(symbol.ty)
    }

    /// Store the result registers into a variable
    fn store_symbol(&mut self, id: SymbolId, span: Span) -> Result<()> {
        let symbol = self.symbol(id)?;
        match (symbol.storage, symbol.ty) {
            (_, ValueType::Void) => {
                return Err(CompileError::VoidVariable {
                    name: symbol.name.clone(),
                    span,
                })
            }
            (Storage::Local { slot }, ty) => {
                let disp = FrameLayout::slot_disp(slot);
                match ty {
                    ValueType::Float => self.code.movsd_mem_xmm(Reg64::RBP, disp, Xmm::XMM0),
                    ValueType::Text => {
                        self.code.mov_mem_r64(Reg64::RBP, disp, Reg64::RAX);
                        self.code.mov_mem_r64(Reg64::RBP, disp - 8, TEXT_LEN_REG);
                    }
                    _ => self.code.mov_mem_r64(Reg64::RBP, disp, Reg64::RAX),
                }
            }
            (Storage::Global { index }, ty) => {
                let index = index as usize;
                match ty {
                    ValueType::Float => {
                        let site = self.code.movsd_rip_xmm(Xmm::XMM0);
                        self.rip_global(site, index, 0);
                    }
                    ValueType::Text => {
                        let site = self.code.mov_rip_r64(Reg64::RAX);
                        self.rip_global(site, index, 0);
                        let site = self.code.mov_rip_r64(TEXT_LEN_REG);
                        self.rip_global(site, index, 8);
                    }
                    _ => {
                        let site = self.code.mov_rip_r64(Reg64::RAX);
                        self.rip_global(site, index, 0);
                    }
                }
            }
        }
        Ok(())
    }

    /// Put the zero value of `ty` in its result registers
    fn zero_value(&mut self, ty: ValueType) {
        match ty {
            ValueType::Float => self.code.xorpd(Xmm::XMM0, Xmm::XMM0),
            ValueType::Text => {
                self.code.xor_r64_r64(Reg64::RAX, Reg64::RAX);
                self.code.xor_r64_r64(TEXT_LEN_REG, TEXT_LEN_REG);
            }
            _ => self.code.xor_r64_r64(Reg64::RAX, Reg64::RAX),
        }
    }

    /// Convert the value in the result registers from `from` to `to`
    fn coerce(&mut self, from: ValueType, to: ValueType, span: Span) -> Result<()> {
        match (from, to) {
            _ if from == to => Ok(()),
            (_, ValueType::Void) => Ok(()),
            (ValueType::Int, ValueType::Bool) | (ValueType::Bool, ValueType::Int) => Ok(()),
            (ValueType::Int | ValueType::Bool, ValueType::Float) => {
                self.code.cvtsi2sd(Xmm::XMM0, Reg64::RAX);
                Ok(())
            }
            (ValueType::Float, ValueType::Int | ValueType::Bool) => {
                self.code.cvttsd2si(Reg64::RAX, Xmm::XMM0);
                Ok(())
            }
            _ => Err(CompileError::unsupported(
                format!("conversion from {} to {}", from, to),
                span,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expr, FunctionDecl};
    use crate::error::ErrorCode;

    fn generate(program: &Program) -> Result<MachineCode> {
        X64Codegen::new(program).generate()
    }

    #[test]
    fn test_entry_stub_layout() {
        let program = Program::new();
        let machine = generate(&program).unwrap();
        assert_eq!(machine.entry_offset, 0);
        // pop rdi; mov rsi, rsp; and rsp, -16
        assert_eq!(&machine.code[..8], &[0x5F, 0x48, 0x89, 0xE6, 0x48, 0x81, 0xE4, 0xF0]);
        // call rel32 lands right after the stub (entry body first)
        assert_eq!(machine.code[11], 0xE8);
        let disp = i32::from_le_bytes([
            machine.code[12],
            machine.code[13],
            machine.code[14],
            machine.code[15],
        ]);
        // stub: 1 + 3 + 7 + 5 + 3 + 7 + 2 = 28 bytes
        assert_eq!(16 + disp as usize, 28);
        // entry body starts with push rbp; mov rbp, rsp
        assert_eq!(&machine.code[28..32], &[0x55, 0x48, 0x89, 0xE5]);
    }

    #[test]
    fn test_rodata_starts_with_newline() {
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::text("hi")));
        let machine = generate(&program).unwrap();
        assert_eq!(machine.rodata, b"\nhi");
    }

    #[test]
    fn test_helpers_emitted_once() {
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::int(1)));
        program.items.push(Stmt::print(Expr::int(2)));
        let machine = generate(&program).unwrap();
        // each print is `mov rdi, rax; call print_int`; helper bodies follow
        let calls = machine.code.windows(4).filter(|w| *w == [0x48, 0x89, 0xC7, 0xE8]).count();
        assert_eq!(calls, 2);
        assert_eq!(machine.rip_patches.len(), 1); // one newline reference
    }

    #[test]
    fn test_globals_must_be_dense() {
        let mut program = Program::new();
        program.declare("a", ValueType::Int, Storage::Global { index: 1 });
        let err = generate(&program).unwrap_err();
        assert!(matches!(err, CompileError::InvalidInput { .. }));
    }

    #[test]
    fn test_global_layout_follows_index_order() {
        let mut program = Program::new();
        program.declare("t", ValueType::Text, Storage::Global { index: 1 });
        program.declare("n", ValueType::Int, Storage::Global { index: 0 });
        let machine = generate(&program).unwrap();
        assert_eq!(machine.globals.get(0).map(|g| g.offset), Some(0));
        assert_eq!(machine.globals.get(1).map(|g| (g.offset, g.size)), Some((8, 16)));
        assert_eq!(machine.globals.total_size(), 24);
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let mut program = Program::new();
        for _ in 0..2 {
            program.items.push(Stmt::new(StmtKind::Function(FunctionDecl {
                name: "f".into(),
                params: vec![],
                ret: ValueType::Int,
                body: vec![],
            })));
        }
        assert!(generate(&program).is_err());
    }

    #[test]
    fn test_call_before_definition() {
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::call("later", vec![], ValueType::Int)));
        program.items.push(Stmt::new(StmtKind::Function(FunctionDecl {
            name: "later".into(),
            params: vec![],
            ret: ValueType::Int,
            body: vec![Stmt::ret(Some(Expr::binary(
                BinaryOp::Add,
                Expr::int(1),
                Expr::int(2),
                ValueType::Int,
            )))],
        })));
        assert!(generate(&program).is_ok());
    }

    #[test]
    fn test_unknown_function_reported() {
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::call("nope", vec![], ValueType::Int)));
        let err = generate(&program).unwrap_err();
        assert!(matches!(err, CompileError::UnknownFunction { ref name, .. } if name == "nope"));
    }

    #[test]
    fn test_float_coercion_on_store() {
        let mut program = Program::new();
        let x = program.declare("x", ValueType::Float, Storage::Local { slot: 0 });
        program.items.push(Stmt::let_(x, Some(Expr::int(3))));
        let machine = generate(&program).unwrap();
        // cvtsi2sd xmm0, rax followed by movsd [rbp-8], xmm0
        let needle = [0xF2, 0x48, 0x0F, 0x2A, 0xC0, 0xF2, 0x0F, 0x11, 0x45, 0xF8];
        assert!(machine.code.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_void_variable_reported_for_globals_and_locals() {
        let mut program = Program::new();
        let g = program.declare("g", ValueType::Void, Storage::Global { index: 0 });
        program.items.push(Stmt::print(Expr::var(g, ValueType::Int)));
        let err = generate(&program).unwrap_err();
        assert_eq!(err.code(), ErrorCode::E300);
        assert!(matches!(err, CompileError::VoidVariable { ref name, .. } if name == "g"));
        assert!(!err.to_string().contains("local"));

        let mut program = Program::new();
        let v = program.declare("v", ValueType::Void, Storage::Local { slot: 0 });
        program.items.push(Stmt::expr(Expr::assign(v, Expr::int(1))));
        let err = generate(&program).unwrap_err();
        assert!(matches!(err, CompileError::VoidVariable { ref name, .. } if name == "v"));
    }
}
