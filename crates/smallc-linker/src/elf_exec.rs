//! ELF64 executable writer.
//!
//! The image is identity-mapped: file offset `x` corresponds to virtual
//! address `base + x`. The first page holds the ELF header and program
//! headers and is covered by the executable segment.

use crate::linker::Linker;
use crate::{BASE_ADDR, PAGE_SIZE};
use smallc_object::{Arch, ByteWriter, SectionKind};

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

const PT_LOAD: u32 = 1;
const PT_GNU_STACK: u32 = 0x6474_E551;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;

struct Phdr {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

pub fn write(linker: &Linker, entry: u64) -> Vec<u8> {
    let machine = match linker.arch() {
        Some(Arch::Arm64) => EM_AARCH64,
        _ => EM_X86_64,
    };

    // Segment extents
    let mut code_end = PAGE_SIZE;
    for section in linker.sections.iter().filter(|s| s.flags.exec) {
        code_end = code_end.max(section.vaddr - BASE_ADDR + section.size);
    }

    let mut data_start = u64::MAX;
    let mut data_file_end = 0u64;
    let mut mem_end = 0u64;
    for section in linker.sections.iter().filter(|s| !s.flags.exec) {
        if section.size == 0 {
            continue;
        }
        data_start = data_start.min(section.vaddr);
        mem_end = mem_end.max(section.vaddr + section.size);
        if section.kind != SectionKind::Bss {
            data_file_end = data_file_end.max(section.vaddr + section.size);
        }
    }
    let has_data = data_start != u64::MAX;

    let mut phdrs = vec![Phdr {
        p_type: PT_LOAD,
        flags: PF_R | PF_X,
        offset: 0,
        vaddr: BASE_ADDR,
        filesz: code_end,
        memsz: code_end,
        align: PAGE_SIZE,
    }];
    if has_data {
        phdrs.push(Phdr {
            p_type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: data_start - BASE_ADDR,
            vaddr: data_start,
            filesz: data_file_end.saturating_sub(data_start),
            memsz: mem_end - data_start,
            align: PAGE_SIZE,
        });
    }
    phdrs.push(Phdr {
        p_type: PT_GNU_STACK,
        flags: PF_R | PF_W,
        offset: 0,
        vaddr: 0,
        filesz: 0,
        memsz: 0,
        align: 16,
    });

    let mut w = ByteWriter::with_capacity(PAGE_SIZE as usize * 2);
    w.emit_bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1]);
    w.emit_bytes(&[0u8; 9]);
    w.emit_u16(ET_EXEC);
    w.emit_u16(machine);
    w.emit_u32(1); // EV_CURRENT
    w.emit_u64(entry);
    w.emit_u64(EHDR_SIZE); // e_phoff
    w.emit_u64(0); // e_shoff
    w.emit_u32(0); // e_flags
    w.emit_u16(EHDR_SIZE as u16);
    w.emit_u16(PHDR_SIZE as u16);
    w.emit_u16(phdrs.len() as u16);
    w.emit_u16(0); // e_shentsize
    w.emit_u16(0); // e_shnum
    w.emit_u16(0); // e_shstrndx

    for phdr in &phdrs {
        w.emit_u32(phdr.p_type);
        w.emit_u32(phdr.flags);
        w.emit_u64(phdr.offset);
        w.emit_u64(phdr.vaddr);
        w.emit_u64(phdr.vaddr); // paddr
        w.emit_u64(phdr.filesz);
        w.emit_u64(phdr.memsz);
        w.emit_u64(phdr.align);
    }

    let mut bytes = w.into_bytes();
    bytes.resize(PAGE_SIZE as usize, 0);

    // Section payloads at their identity file offsets
    let mut ordered: Vec<&crate::linker::OutSection> = linker
        .sections
        .iter()
        .filter(|s| s.kind != SectionKind::Bss && s.size > 0)
        .collect();
    ordered.sort_by_key(|s| s.vaddr);
    for section in ordered {
        let offset = (section.vaddr - BASE_ADDR) as usize;
        if bytes.len() < offset {
            bytes.resize(offset, 0);
        }
        bytes.extend_from_slice(&section.data);
    }
    bytes
}
