//! ELF64 Executable Generation
//!
//! Generates static Linux x86-64 ELF executables with two loadable segments:
//!
//! ```text
//! file offset 0      ELF header + 2 program headers
//! 0x1000             code            (PT_LOAD, R+X)
//! next page          read-only data  (PT_LOAD, R+W)
//!                    zero-filled globals (memory only, memsz > filesz)
//! ```
//!
//! RIP-relative fields in the code are resolved here, once the virtual
//! addresses of the constant pool and the global area are known.
//! No external linker required.

use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{CompileError, Result};

use super::encoding::CodeBuffer;
use super::tables::{GlobalTable, RipPatch, RipTarget};

/// ELF64 file header constants
pub mod consts {
    // ELF magic number
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    // ELF class
    pub const ELFCLASS64: u8 = 2;

    // Data encoding
    pub const ELFDATA2LSB: u8 = 1; // Little endian

    // ELF version
    pub const EV_CURRENT: u8 = 1;

    // OS/ABI
    pub const ELFOSABI_NONE: u8 = 0; // UNIX System V ABI

    // Object file type
    pub const ET_EXEC: u16 = 2; // Executable file

    // Machine type
    pub const EM_X86_64: u16 = 62;

    // Program header types
    pub const PT_LOAD: u32 = 1;

    // Program header flags
    pub const PF_X: u32 = 1; // Execute
    pub const PF_W: u32 = 2; // Write
    pub const PF_R: u32 = 4; // Read

    // Header sizes
    pub const ELF64_EHDR_SIZE: u16 = 64;
    pub const ELF64_PHDR_SIZE: u16 = 56;

    // Default load address for Linux x86-64
    pub const DEFAULT_LOAD_ADDR: u64 = 0x400000;

    pub const PAGE_SIZE: u64 = 0x1000;
}

/// Round up to the next page boundary
pub fn page_align(value: u64) -> u64 {
    (value + consts::PAGE_SIZE - 1) & !(consts::PAGE_SIZE - 1)
}

fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

/// ELF64 file header
#[derive(Debug, Clone)]
pub struct Elf64Header {
    pub e_type: u16,      // Object file type
    pub e_machine: u16,   // Machine type
    pub e_version: u32,   // Object file version
    pub e_entry: u64,     // Entry point address
    pub e_phoff: u64,     // Program header offset
    pub e_shoff: u64,     // Section header offset
    pub e_flags: u32,     // Processor-specific flags
    pub e_ehsize: u16,    // ELF header size
    pub e_phentsize: u16, // Program header entry size
    pub e_phnum: u16,     // Number of program headers
    pub e_shentsize: u16, // Section header entry size
    pub e_shnum: u16,     // Number of section headers
    pub e_shstrndx: u16,  // Section name string table index
}

impl Default for Elf64Header {
    fn default() -> Self {
        Self {
            e_type: consts::ET_EXEC,
            e_machine: consts::EM_X86_64,
            e_version: consts::EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: consts::ELF64_EHDR_SIZE as u64,
            e_shoff: 0, // No section headers
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: consts::ELF64_PHDR_SIZE,
            e_phnum: 2,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}

impl Elf64Header {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_ident (16 bytes)
        w.write_all(&consts::ELF_MAGIC)?;
        w.write_all(&[consts::ELFCLASS64])?; // EI_CLASS
        w.write_all(&[consts::ELFDATA2LSB])?; // EI_DATA
        w.write_all(&[consts::EV_CURRENT])?; // EI_VERSION
        w.write_all(&[consts::ELFOSABI_NONE])?; // EI_OSABI
        w.write_all(&[0u8; 8])?; // EI_PAD

        // Rest of header
        w.write_all(&self.e_type.to_le_bytes())?;
        w.write_all(&self.e_machine.to_le_bytes())?;
        w.write_all(&self.e_version.to_le_bytes())?;
        w.write_all(&self.e_entry.to_le_bytes())?;
        w.write_all(&self.e_phoff.to_le_bytes())?;
        w.write_all(&self.e_shoff.to_le_bytes())?;
        w.write_all(&self.e_flags.to_le_bytes())?;
        w.write_all(&self.e_ehsize.to_le_bytes())?;
        w.write_all(&self.e_phentsize.to_le_bytes())?;
        w.write_all(&self.e_phnum.to_le_bytes())?;
        w.write_all(&self.e_shentsize.to_le_bytes())?;
        w.write_all(&self.e_shnum.to_le_bytes())?;
        w.write_all(&self.e_shstrndx.to_le_bytes())?;

        Ok(())
    }
}

/// ELF64 program header
#[derive(Debug, Clone)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,   // Segment type
    pub p_flags: u32,  // Segment flags
    pub p_offset: u64, // Segment file offset
    pub p_vaddr: u64,  // Segment virtual address
    pub p_paddr: u64,  // Segment physical address
    pub p_filesz: u64, // Segment size in file
    pub p_memsz: u64,  // Segment size in memory
    pub p_align: u64,  // Segment alignment
}

impl Elf64ProgramHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.p_type.to_le_bytes())?;
        w.write_all(&self.p_flags.to_le_bytes())?;
        w.write_all(&self.p_offset.to_le_bytes())?;
        w.write_all(&self.p_vaddr.to_le_bytes())?;
        w.write_all(&self.p_paddr.to_le_bytes())?;
        w.write_all(&self.p_filesz.to_le_bytes())?;
        w.write_all(&self.p_memsz.to_le_bytes())?;
        w.write_all(&self.p_align.to_le_bytes())?;
        Ok(())
    }
}

/// Computed placement of both segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub code_offset: u64,
    pub code_vaddr: u64,
    pub code_size: u64,
    pub data_offset: u64,
    pub data_vaddr: u64,
    pub rodata_size: u64,
    pub bss_vaddr: u64,
    pub bss_size: u64,
    pub entry: u64,
}

impl SegmentLayout {
    /// Bytes of the data segment present in the file
    pub fn data_filesz(&self) -> u64 {
        self.rodata_size
    }

    /// Bytes of the data segment mapped in memory (rodata + padding + globals)
    pub fn data_memsz(&self) -> u64 {
        self.bss_vaddr + self.bss_size - self.data_vaddr
    }

    /// Total size of the output file
    pub fn file_size(&self) -> u64 {
        self.data_offset + self.rodata_size
    }

    fn program_headers(&self) -> [Elf64ProgramHeader; 2] {
        [
            Elf64ProgramHeader {
                p_type: consts::PT_LOAD,
                p_flags: consts::PF_R | consts::PF_X,
                p_offset: self.code_offset,
                p_vaddr: self.code_vaddr,
                p_paddr: self.code_vaddr,
                p_filesz: self.code_size,
                p_memsz: self.code_size,
                p_align: consts::PAGE_SIZE,
            },
            Elf64ProgramHeader {
                p_type: consts::PT_LOAD,
                p_flags: consts::PF_R | consts::PF_W,
                p_offset: self.data_offset,
                p_vaddr: self.data_vaddr,
                p_paddr: self.data_vaddr,
                p_filesz: self.data_filesz(),
                p_memsz: self.data_memsz(),
                p_align: consts::PAGE_SIZE,
            },
        ]
    }
}

/// ELF64 executable builder
#[derive(Debug)]
pub struct Elf64Builder {
    load_addr: u64,
    code: Vec<u8>,
    rodata: Vec<u8>,
    globals: GlobalTable,
    rip_patches: Vec<RipPatch>,
    entry_offset: u64,
}

impl Elf64Builder {
    pub fn new() -> Self {
        Self {
            load_addr: consts::DEFAULT_LOAD_ADDR,
            code: Vec::new(),
            rodata: Vec::new(),
            globals: GlobalTable::new(),
            rip_patches: Vec::new(),
            entry_offset: 0,
        }
    }

    /// Set the load address (default: 0x400000)
    pub fn load_addr(mut self, addr: u64) -> Self {
        self.load_addr = addr;
        self
    }

    /// Set the executable code
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    /// Set the read-only constant data
    pub fn rodata(mut self, rodata: Vec<u8>) -> Self {
        self.rodata = rodata;
        self
    }

    /// Set the global variable layout (sizes the zero-filled area)
    pub fn globals(mut self, globals: GlobalTable) -> Self {
        self.globals = globals;
        self
    }

    /// Set the RIP-relative fields to resolve
    pub fn rip_patches(mut self, patches: Vec<RipPatch>) -> Self {
        self.rip_patches = patches;
        self
    }

    /// Offset of the entry point within the code (default: 0)
    pub fn entry_offset(mut self, offset: u64) -> Self {
        self.entry_offset = offset;
        self
    }

    /// Compute segment placement
    pub fn layout(&self) -> SegmentLayout {
        let headers_size = consts::ELF64_EHDR_SIZE as u64 + 2 * consts::ELF64_PHDR_SIZE as u64;
        let code_offset = page_align(headers_size);
        let code_vaddr = self.load_addr + code_offset;
        let code_size = self.code.len() as u64;

        let data_offset = page_align(code_offset + code_size);
        let data_vaddr = self.load_addr + data_offset;
        let rodata_size = self.rodata.len() as u64;

        SegmentLayout {
            code_offset,
            code_vaddr,
            code_size,
            data_offset,
            data_vaddr,
            rodata_size,
            bss_vaddr: align8(data_vaddr + rodata_size),
            bss_size: self.globals.total_size() as u64,
            entry: code_vaddr + self.entry_offset,
        }
    }

    /// Absolute address a RIP-relative field refers to
    fn rip_target_addr(&self, layout: &SegmentLayout, target: RipTarget) -> Result<u64> {
        match target {
            RipTarget::Const { offset } => {
                if offset > self.rodata.len() {
                    return Err(CompileError::internal(format!(
                        "constant offset {:#x} beyond the {}-byte pool",
                        offset,
                        self.rodata.len()
                    )));
                }
                Ok(layout.data_vaddr + offset as u64)
            }
            RipTarget::Global { index, extra } => {
                let global = self.globals.get(index).ok_or_else(|| {
                    CompileError::internal(format!("reference to unknown global #{}", index))
                })?;
                Ok(layout.bss_vaddr + (global.offset + extra) as u64)
            }
        }
    }

    /// Patch every RIP-relative field: target - address of the next byte
    fn resolve_rip_patches(&self, layout: &SegmentLayout, code: Vec<u8>) -> Result<Vec<u8>> {
        let mut code = CodeBuffer::from(code);
        for patch in &self.rip_patches {
            let target = self.rip_target_addr(layout, patch.target)?;
            let next = layout.code_vaddr + patch.site as u64 + 4;
            let disp = target as i64 - next as i64;
            let disp = i32::try_from(disp).map_err(|_| {
                CompileError::internal(format!("RIP displacement {} out of range", disp))
            })?;
            code.patch_i32(patch.site, disp)?;
        }
        Ok(code.into_code())
    }

    /// Build the complete ELF file
    pub fn build(mut self) -> Result<Vec<u8>> {
        let layout = self.layout();
        let code = std::mem::take(&mut self.code);
        let code = self.resolve_rip_patches(&layout, code)?;
        debug!(
            code_vaddr = format_args!("{:#x}", layout.code_vaddr),
            code_size = layout.code_size,
            data_vaddr = format_args!("{:#x}", layout.data_vaddr),
            rodata_size = layout.rodata_size,
            bss_size = layout.bss_size,
            rip_patches = self.rip_patches.len(),
            "laid out ELF64 image"
        );

        let ehdr = Elf64Header {
            e_entry: layout.entry,
            ..Default::default()
        };

        let mut buf = Vec::with_capacity(layout.file_size() as usize);
        Self::serialize(&mut buf, &ehdr, &layout, &code, &self.rodata)
            .map_err(|e| CompileError::internal(format!("serializing ELF image: {}", e)))?;
        Ok(buf)
    }

    fn serialize(
        buf: &mut Vec<u8>,
        ehdr: &Elf64Header,
        layout: &SegmentLayout,
        code: &[u8],
        rodata: &[u8],
    ) -> io::Result<()> {
        ehdr.write(buf)?;
        for phdr in layout.program_headers() {
            phdr.write(buf)?;
        }
        buf.resize(layout.code_offset as usize, 0);
        buf.write_all(code)?;
        buf.resize(layout.data_offset as usize, 0);
        buf.write_all(rodata)?;
        Ok(())
    }

    /// Build and write to a file
    pub fn write_to_file(self, path: &Path) -> Result<()> {
        let data = self.build()?;
        write_executable(path, &data)
    }
}

impl Default for Elf64Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Write an image and mark it executable
pub fn write_executable(path: &Path, data: &[u8]) -> Result<()> {
    use std::fs::File;

    let io_err = |source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(data).map_err(io_err)?;

    // Make executable (chmod +x) - Unix only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(io_err)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).map_err(io_err)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u64_at(bytes: &[u8], offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    fn i32_at(bytes: &[u8], offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[offset..offset + 4]);
        i32::from_le_bytes(raw)
    }

    #[test]
    fn test_elf_header_size() {
        let ehdr = Elf64Header::default();
        let mut buf = Vec::new();
        ehdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_program_header_size() {
        let phdr = Elf64ProgramHeader {
            p_type: consts::PT_LOAD,
            p_flags: consts::PF_R | consts::PF_X,
            p_offset: 0x1000,
            p_vaddr: 0x401000,
            p_paddr: 0x401000,
            p_filesz: 120,
            p_memsz: 120,
            p_align: 0x1000,
        };
        let mut buf = Vec::new();
        phdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 56);
    }

    #[test]
    fn test_elf_magic() {
        let elf = Elf64Builder::new().code(vec![0xC3]).build().unwrap();

        // Check ELF magic
        assert_eq!(&elf[0..4], &[0x7F, b'E', b'L', b'F']);

        // Check class (64-bit)
        assert_eq!(elf[4], 2);

        // Check data encoding (little endian)
        assert_eq!(elf[5], 1);

        // ET_EXEC, EM_X86_64, two program headers, no sections
        assert_eq!(u16::from_le_bytes([elf[16], elf[17]]), consts::ET_EXEC);
        assert_eq!(u16::from_le_bytes([elf[18], elf[19]]), consts::EM_X86_64);
        assert_eq!(u16::from_le_bytes([elf[56], elf[57]]), 2);
        assert_eq!(u16::from_le_bytes([elf[60], elf[61]]), 0);
    }

    #[test]
    fn test_entry_point() {
        let builder = Elf64Builder::new().code(vec![0xC3]);
        let layout = builder.layout();
        assert_eq!(layout.code_offset, 0x1000);
        assert_eq!(layout.entry, 0x401000);

        let elf = builder.build().unwrap();
        assert_eq!(u64_at(&elf, 24), 0x401000);
        assert_eq!(elf[0x1000], 0xC3);
    }

    #[test]
    fn test_data_segment_placement() {
        let mut globals = GlobalTable::new();
        globals.add("g", 16);
        let builder = Elf64Builder::new()
            .code(vec![0x90; 0x1234])
            .rodata(b"\nhello".to_vec())
            .globals(globals);
        let layout = builder.layout();
        assert_eq!(layout.data_offset, 0x3000);
        assert_eq!(layout.data_vaddr, 0x403000);
        assert_eq!(layout.bss_vaddr, 0x403008);
        assert_eq!(layout.data_filesz(), 6);
        assert_eq!(layout.data_memsz(), 8 + 16);

        let elf = builder.build().unwrap();
        assert_eq!(elf.len(), 0x3006);
        assert_eq!(&elf[0x3000..], b"\nhello");

        // second program header: flags R+W, filesz, memsz
        let ph = 64 + 56;
        assert_eq!(u32::from_le_bytes([elf[ph + 4], elf[ph + 5], elf[ph + 6], elf[ph + 7]]), 6);
        assert_eq!(u64_at(&elf, ph + 32), 6);
        assert_eq!(u64_at(&elf, ph + 40), 24);
    }

    #[test]
    fn test_rip_patches_resolve_to_absolute_targets() {
        let mut code = CodeBuffer::new();
        let to_const = code.lea_r64_rip(crate::x64::registers::Reg64::RAX);
        let to_global = code.mov_r64_rip(crate::x64::registers::Reg64::RBX);

        let mut globals = GlobalTable::new();
        globals.add("a", 8);
        globals.add("s", 16);

        let builder = Elf64Builder::new()
            .code(code.into_code())
            .rodata(b"\nabc".to_vec())
            .globals(globals)
            .rip_patches(vec![
                RipPatch {
                    site: to_const,
                    target: RipTarget::Const { offset: 1 },
                },
                RipPatch {
                    site: to_global,
                    target: RipTarget::Global { index: 1, extra: 8 },
                },
            ]);
        let layout = builder.layout();
        let elf = builder.build().unwrap();

        let base = layout.code_offset as usize;
        let disp = i32_at(&elf, base + to_const) as i64;
        let next = (layout.code_vaddr + to_const as u64 + 4) as i64;
        assert_eq!((next + disp) as u64, layout.data_vaddr + 1);

        let disp = i32_at(&elf, base + to_global) as i64;
        let next = (layout.code_vaddr + to_global as u64 + 4) as i64;
        assert_eq!((next + disp) as u64, layout.bss_vaddr + 16);
    }

    #[test]
    fn test_unknown_global_is_internal_error() {
        let mut code = CodeBuffer::new();
        let site = code.mov_r64_rip(crate::x64::registers::Reg64::RAX);
        let err = Elf64Builder::new()
            .code(code.into_code())
            .rip_patches(vec![RipPatch {
                site,
                target: RipTarget::Global { index: 3, extra: 0 },
            }])
            .build()
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_bad_constant_offset_is_internal_error() {
        let mut code = CodeBuffer::new();
        let site = code.lea_r64_rip(crate::x64::registers::Reg64::RAX);
        let err = Elf64Builder::new()
            .code(code.into_code())
            .rodata(vec![b'\n'])
            .rip_patches(vec![RipPatch {
                site,
                target: RipTarget::Const { offset: 64 },
            }])
            .build()
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_write_to_file_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.out");
        Elf64Builder::new().code(vec![0xC3]).write_to_file(&path).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[0..4], &consts::ELF_MAGIC);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_write_to_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("a.out");
        let err = Elf64Builder::new().code(vec![0xC3]).write_to_file(&path).unwrap_err();
        assert!(matches!(err, CompileError::Io { .. }));
    }

    mod props {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn segments_never_overlap(
                code_len in 0usize..20_000,
                rodata_len in 0usize..9_000,
                globals in 0usize..64,
            ) {
                let mut table = GlobalTable::new();
                for i in 0..globals {
                    table.add(format!("g{}", i), if i % 3 == 0 { 16 } else { 8 });
                }
                let layout = Elf64Builder::new()
                    .code(vec![0x90; code_len])
                    .rodata(vec![0; rodata_len])
                    .globals(table)
                    .layout();

                prop_assert!(layout.code_offset >= 64 + 2 * 56);
                prop_assert!(layout.code_offset + layout.code_size <= layout.data_offset);
                prop_assert!(layout.code_vaddr + layout.code_size <= layout.data_vaddr);
                prop_assert_eq!(layout.data_offset % consts::PAGE_SIZE, 0);
                prop_assert!(layout.data_memsz() >= layout.data_filesz());
                prop_assert_eq!(layout.bss_vaddr % 8, 0);
                prop_assert!(layout.bss_vaddr >= layout.data_vaddr + layout.rodata_size);
                // file offset and vaddr agree modulo the page size
                prop_assert_eq!(
                    layout.data_vaddr % consts::PAGE_SIZE,
                    layout.data_offset % consts::PAGE_SIZE
                );
            }
        }
    }
}
