//! Structural tests on generated images (no execution)

use elfc::ast::{Expr, Program, Span, Stmt, StmtKind};
use elfc::{compile_program, layout_program, CompileError, ErrorCode};

const SQUARES: &str = include_str!("../demos/squares.json");

fn u16_at(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

fn u32_at(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
}

fn u64_at(image: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(image[offset..offset + 8].try_into().unwrap())
}

#[test]
fn test_demo_program_parses() {
    let program = Program::from_json(SQUARES).unwrap();
    assert_eq!(program.symbols.len(), 3);
    assert_eq!(program.items.len(), 4);
    let json = program.to_json().unwrap();
    assert_eq!(Program::from_json(&json).unwrap().items, program.items);
}

#[test]
fn test_elf_header_fields() {
    let program = Program::from_json(SQUARES).unwrap();
    let image = compile_program(&program).unwrap();

    assert_eq!(&image[..4], b"\x7fELF");
    assert_eq!(image[4], 2); // ELFCLASS64
    assert_eq!(image[5], 1); // little endian
    assert_eq!(u16_at(&image, 16), 2); // ET_EXEC
    assert_eq!(u16_at(&image, 18), 62); // EM_X86_64
    assert_eq!(u64_at(&image, 24), 0x401000); // entry = first code byte
    assert_eq!(u16_at(&image, 56), 2); // e_phnum
    assert_eq!(u16_at(&image, 60), 0); // e_shnum
}

#[test]
fn test_program_headers() {
    let program = Program::from_json(SQUARES).unwrap();
    let image = compile_program(&program).unwrap();

    let text = 64;
    assert_eq!(u32_at(&image, text), 1); // PT_LOAD
    assert_eq!(u32_at(&image, text + 4), 5); // R+X
    assert_eq!(u64_at(&image, text + 8), 0x1000);

    let data = 64 + 56;
    assert_eq!(u32_at(&image, data), 1);
    assert_eq!(u32_at(&image, data + 4), 6); // R+W
    let filesz = u64_at(&image, data + 32);
    let memsz = u64_at(&image, data + 40);
    assert!(memsz >= filesz + 16, "globals live past the file image");

    // Data segment starts with the shared newline
    let data_offset = u64_at(&image, data + 8) as usize;
    assert_eq!(image[data_offset], b'\n');
    assert_eq!(image.len(), data_offset + filesz as usize);
}

#[test]
fn test_layout_matches_image() {
    let program = Program::from_json(SQUARES).unwrap();
    let layout = layout_program(&program).unwrap();
    assert_eq!(layout.code_offset, 0x1000);
    assert_eq!(layout.code_vaddr, 0x401000);
    assert_eq!(layout.data_offset % 0x1000, 0);
    assert!(layout.data_offset >= layout.code_offset + layout.code_size);
    assert_eq!(layout.bss_vaddr % 8, 0);
    assert_eq!(layout.bss_size, 16);
}

#[test]
fn test_malformed_json_rejected() {
    let err = Program::from_json("{\"items\": [{\"kind\": 3}]}").unwrap_err();
    assert_eq!(err.code(), ErrorCode::E902);
}

#[test]
fn test_diagnostic_report_has_location() {
    let mut program = Program::new();
    program.items.push(
        Stmt::new(StmtKind::Continue { label: None }).at(Span::new(10, 18, 2, 5)),
    );
    let err = compile_program(&program).unwrap_err();
    assert!(matches!(err, CompileError::InvalidControlFlow { .. }));
    let report = err.report();
    assert!(report.starts_with("error[E302]"));
    assert!(report.ends_with("--> 2:5"));
}

#[test]
fn test_unsupported_is_reported_not_skipped() {
    let mut program = Program::new();
    program.items.push(Stmt::print(Expr::print(Expr::int(1))));
    let err = compile_program(&program).unwrap_err();
    assert_eq!(err.code(), ErrorCode::E301);
}
