//! Constant & Symbol Tables
//!
//! Bookkeeping shared by the code generator and the ELF writer:
//!
//! - `LabelTable`: label offsets plus the list of rel32 fields waiting on them
//! - `ConstantPool`: deduplicated string and double literals (read-only data)
//! - `GlobalTable`: layout of the zero-initialized global area
//! - `FunctionTable`: source function names, registered before any body
//! - `RipPatch`: RIP-relative fields resolved once virtual addresses exist

use std::collections::HashMap;
use std::fmt;

use crate::ast::ValueType;
use crate::error::{CompileError, Result};

use super::encoding::CodeBuffer;

/// Offset of the shared `"\n"` constant in the pool
pub const NEWLINE_OFFSET: usize = 0;

/// Handle to a code position that may not be known yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A rel32 field waiting for its label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    /// Buffer offset of the 4-byte displacement
    pub site: usize,
    pub label: Label,
}

/// Label arena: `None` until the label is fixed
#[derive(Debug, Default)]
pub struct LabelTable {
    offsets: Vec<Option<usize>>,
    patches: Vec<PatchSite>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unfixed label
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.offsets.len() as u32);
        self.offsets.push(None);
        label
    }

    /// Fix a label at a code offset (at most once)
    pub fn fix(&mut self, label: Label, offset: usize) -> Result<()> {
        let slot = self
            .offsets
            .get_mut(label.0 as usize)
            .ok_or_else(|| CompileError::internal(format!("label {} was never allocated", label)))?;
        if let Some(previous) = slot {
            return Err(CompileError::internal(format!(
                "label {} fixed twice (at {:#x} and {:#x})",
                label, previous, offset
            )));
        }
        *slot = Some(offset);
        Ok(())
    }

    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.offsets.get(label.0 as usize).copied().flatten()
    }

    /// Record a rel32 field that must point at `label`
    pub fn add_patch(&mut self, site: usize, label: Label) {
        self.patches.push(PatchSite { site, label });
    }

    pub fn patches(&self) -> &[PatchSite] {
        &self.patches
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Write `label_offset - (site + 4)` into every pending field
    pub fn resolve(&self, code: &mut CodeBuffer) -> Result<usize> {
        for patch in &self.patches {
            let target = self.offset_of(patch.label).ok_or_else(|| {
                CompileError::internal(format!(
                    "label {} referenced at {:#x} was never fixed",
                    patch.label, patch.site
                ))
            })?;
            let disp = target as i64 - (patch.site as i64 + 4);
            let disp = i32::try_from(disp).map_err(|_| {
                CompileError::internal(format!("jump displacement {} out of rel32 range", disp))
            })?;
            code.patch_i32(patch.site, disp)?;
        }
        Ok(self.patches.len())
    }
}

/// Destination of a RIP-relative field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RipTarget {
    /// Offset into the read-only constant pool
    Const { offset: usize },
    /// Global variable plus a byte offset inside it
    Global { index: usize, extra: usize },
}

/// A `[rip + disp32]` field resolved after layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipPatch {
    pub site: usize,
    pub target: RipTarget,
}

/// Deduplicated literal storage backing the read-only data segment
#[derive(Debug)]
pub struct ConstantPool {
    data: CodeBuffer,
    strings: HashMap<Vec<u8>, usize>,
    doubles: HashMap<u64, usize>,
}

impl ConstantPool {
    /// A pool whose first byte is the shared newline
    pub fn new() -> Self {
        let mut pool = Self {
            data: CodeBuffer::new(),
            strings: HashMap::new(),
            doubles: HashMap::new(),
        };
        pool.intern_str(b"\n");
        pool
    }

    /// Intern a string literal; equal byte sequences share one entry
    pub fn intern_str(&mut self, bytes: &[u8]) -> usize {
        if let Some(&offset) = self.strings.get(bytes) {
            return offset;
        }
        let offset = self.data.offset();
        self.data.emit_bytes(bytes);
        self.strings.insert(bytes.to_vec(), offset);
        offset
    }

    /// Intern a double (8-byte aligned); keyed by bit pattern
    pub fn intern_f64(&mut self, value: f64) -> usize {
        let bits = value.to_bits();
        if let Some(&offset) = self.doubles.get(&bits) {
            return offset;
        }
        self.data.align_to(8);
        let offset = self.data.offset();
        self.data.emit_u64(bits);
        self.doubles.insert(bits, offset);
        offset
    }

    pub fn len(&self) -> usize {
        self.data.offset()
    }

    pub fn is_empty(&self) -> bool {
        self.data.offset() == 0
    }

    pub fn data(&self) -> &[u8] {
        self.data.code()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_code()
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A variable in the zero-initialized area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalVariable {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Global variable layout, indexed in registration order
#[derive(Debug, Clone, Default)]
pub struct GlobalTable {
    globals: Vec<GlobalVariable>,
    size: usize,
}

impl GlobalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of a global holding a value of type `ty`
    pub fn size_for(ty: ValueType) -> usize {
        if ty == ValueType::Text {
            16
        } else {
            8
        }
    }

    /// Append a global and return its index
    pub fn add(&mut self, name: impl Into<String>, size: usize) -> usize {
        let offset = (self.size + 7) & !7;
        self.globals.push(GlobalVariable {
            name: name.into(),
            offset,
            size,
        });
        self.size = offset + size;
        self.globals.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&GlobalVariable> {
        self.globals.get(index)
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    /// Bytes of zero-initialized memory required
    pub fn total_size(&self) -> usize {
        self.size
    }
}

/// A callable user function
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub label: Label,
    pub params: Vec<ValueType>,
    pub ret: ValueType,
}

impl FunctionEntry {
    /// Argument words the caller passes
    pub fn arg_words(&self) -> u32 {
        self.params.iter().map(|ty| ty.words()).sum()
    }
}

/// Function name -> entry
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: HashMap<String, FunctionEntry>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function; duplicate names are rejected
    pub fn register(&mut self, name: &str, entry: FunctionEntry) -> Result<()> {
        if self.functions.contains_key(name) {
            return Err(CompileError::InvalidInput {
                message: format!("function '{}' is defined twice", name),
            });
        }
        self.functions.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
