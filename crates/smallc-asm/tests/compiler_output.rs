//! Assemble the kind of text the compiler emits, end to end.

use smallc_asm::assemble;
use smallc_object::{Arch, RelocKind, SectionKind, SymbolBinding};

const X64_FIB: &str = r#"
.text
.globl fib
fib:
  pushq %rbp
  movq %rsp, %rbp
  pushq %rdi
  subq $8, %rsp
  movq -8(%rbp), %rax
  pushq %rax
  movq $1, %rax
  popq %rdx
  cmpq %rax, %rdx
  setle %al
  movzbq %al, %rax
  testq %rax, %rax
  jz L1
  movq -8(%rbp), %rax
  movq %rbp, %rsp
  popq %rbp
  ret
L1:
  movq -8(%rbp), %rax
  pushq %rax
  movq $1, %rax
  popq %rdx
  subq %rax, %rdx
  movq %rdx, %rax
  pushq %rax
  popq %rdi
  call fib
  pushq %rax
  movq -8(%rbp), %rax
  pushq %rax
  movq $2, %rax
  popq %rdx
  subq %rax, %rdx
  movq %rdx, %rax
  pushq %rax
  popq %rdi
  call fib
  popq %rdx
  addq %rdx, %rax
  movq %rbp, %rsp
  popq %rbp
  ret
"#;

const X64_DATA: &str = r#"
.text
.globl main
main:
  pushq %rbp
  movq %rsp, %rbp
.data
S1:
  .asciz "Hi"
.text
  movq $S1, %rax
  pushq %rax
  popq %rdi
  call puts
  xorq %rax, %rax
  movq %rbp, %rsp
  popq %rbp
  ret
.data
.globl counter
counter:
  .quad 0
"#;

const ARM64_MAIN: &str = r#"
.text
.globl main
main:
  stp x29, x30, [sp, #-16]!
  mov x29, sp
  adrp x0, g
  ldr x0, [x0, :lo12:g]
  cbz x0, L1
  mov x0, #1
  b L2
L1:
  mov x0, #0
L2:
  mov sp, x29
  ldp x29, x30, [sp], #16
  ret
"#;

#[test]
fn test_fib_assembles_with_local_calls_resolved() {
    let obj = assemble(X64_FIB, Arch::X64).unwrap();
    obj.validate().unwrap();

    let fib = &obj.symbols[obj.find_symbol("fib").unwrap()];
    assert_eq!(fib.binding, SymbolBinding::Global);
    assert!(fib.defined);
    assert_eq!(fib.value, 0);

    // Both recursive calls resolve inside the section: no relocations left
    assert!(
        obj.relocs.is_empty(),
        "expected no relocs, got {:?}",
        obj.relocs
    );
}

#[test]
fn test_data_and_external_call() {
    let obj = assemble(X64_DATA, Arch::X64).unwrap();
    obj.validate().unwrap();

    let data = &obj.sections[obj.find_section(".data").unwrap()];
    assert_eq!(data.kind, SectionKind::Data);
    assert_eq!(&data.data[..3], b"Hi\0");
    // counter's .quad 0 follows the string
    assert_eq!(data.size, 11);

    // One reloc for $S1, one for the call to the undefined puts
    let kinds: Vec<RelocKind> = obj.relocs.iter().map(|r| r.kind).collect();
    assert!(kinds.contains(&RelocKind::Abs32S));
    assert!(kinds.contains(&RelocKind::Pc32));

    let puts = &obj.symbols[obj.find_symbol("puts").unwrap()];
    assert!(!puts.defined);
    assert_eq!(puts.binding, SymbolBinding::External);
}

#[test]
fn test_arm64_page_addressing_and_branches() {
    let obj = assemble(ARM64_MAIN, Arch::Arm64).unwrap();
    obj.validate().unwrap();

    let text = &obj.sections[0];
    assert_eq!(text.size % 4, 0);

    let kinds: Vec<RelocKind> = obj.relocs.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![RelocKind::AdrPrelPgHi21, RelocKind::Ldst64AbsLo12Nc]
    );

    // cbz and b resolved locally: the unconditional b jumps from word 6 to
    // word 8 (L2), so its imm26 is 2
    let words: Vec<u32> = text
        .data
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let b_word = words[6];
    assert_eq!(b_word, 0x1400_0002);
}
