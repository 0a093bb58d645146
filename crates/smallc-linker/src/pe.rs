//! PE32+ (AMD64) executable writer.
//!
//! DOS stub with `e_lfanew = 0x80`, COFF header, PE32+ optional header
//! (magic 0x20B), section table with RVAs, payloads on `FILE_ALIGN`
//! boundaries.

use crate::linker::Linker;
use crate::{FILE_ALIGN, IMAGE_BASE, PAGE_SIZE};
use smallc_object::{ByteWriter, SectionKind};

const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;
const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE: u16 = 0x8000;

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const OPTIONAL_HEADER_SIZE: u16 = 0xF0;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn section_characteristics(section: &crate::linker::OutSection) -> u32 {
    let mut bits = IMAGE_SCN_MEM_READ;
    match section.kind {
        SectionKind::Text => bits |= IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE,
        SectionKind::Bss => bits |= IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_WRITE,
        _ => {
            bits |= IMAGE_SCN_CNT_INITIALIZED_DATA;
            if section.flags.write {
                bits |= IMAGE_SCN_MEM_WRITE;
            }
        }
    }
    bits
}

pub fn write(linker: &Linker, entry: u64) -> Vec<u8> {
    let sections: Vec<&crate::linker::OutSection> =
        linker.sections.iter().filter(|s| s.size > 0).collect();

    let headers_size = align_up(
        0x80 + 4 + 20 + OPTIONAL_HEADER_SIZE as u64 + sections.len() as u64 * 40,
        FILE_ALIGN,
    );

    // File offsets per section, bss gets none
    let mut raw_offsets = Vec::with_capacity(sections.len());
    let mut next_raw = headers_size;
    for section in &sections {
        if section.kind == SectionKind::Bss {
            raw_offsets.push(0u64);
        } else {
            raw_offsets.push(next_raw);
            next_raw += align_up(section.size, FILE_ALIGN);
        }
    }

    let image_end = sections
        .iter()
        .map(|s| align_up(s.vaddr - IMAGE_BASE + s.size, PAGE_SIZE))
        .max()
        .unwrap_or(PAGE_SIZE);

    let code_size: u64 = sections
        .iter()
        .filter(|s| s.kind == SectionKind::Text)
        .map(|s| align_up(s.size, FILE_ALIGN))
        .sum();
    let init_data_size: u64 = sections
        .iter()
        .filter(|s| s.kind == SectionKind::Data || s.kind == SectionKind::Other)
        .map(|s| align_up(s.size, FILE_ALIGN))
        .sum();
    let uninit_data_size: u64 = sections
        .iter()
        .filter(|s| s.kind == SectionKind::Bss)
        .map(|s| s.size)
        .sum();
    let base_of_code = sections
        .iter()
        .find(|s| s.kind == SectionKind::Text)
        .map_or(PAGE_SIZE, |s| s.vaddr - IMAGE_BASE);

    let mut w = ByteWriter::with_capacity(headers_size as usize);

    // DOS stub
    w.emit_bytes(b"MZ");
    w.emit_bytes(&[0u8; 0x3A]);
    w.emit_u32(0x80); // e_lfanew
    while w.offset() < 0x80 {
        w.emit_u8(0);
    }

    w.emit_u32(IMAGE_NT_SIGNATURE);

    // COFF header
    w.emit_u16(IMAGE_FILE_MACHINE_AMD64);
    w.emit_u16(sections.len() as u16);
    w.emit_u32(0); // timestamp
    w.emit_u32(0); // symbol table
    w.emit_u32(0); // symbol count
    w.emit_u16(OPTIONAL_HEADER_SIZE);
    w.emit_u16(IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE);

    // PE32+ optional header
    w.emit_u16(0x20B);
    w.emit_u8(14); // linker major
    w.emit_u8(0); // linker minor
    w.emit_u32(code_size as u32);
    w.emit_u32(init_data_size as u32);
    w.emit_u32(uninit_data_size as u32);
    w.emit_u32((entry - IMAGE_BASE) as u32);
    w.emit_u32(base_of_code as u32);
    w.emit_u64(IMAGE_BASE);
    w.emit_u32(PAGE_SIZE as u32); // section alignment
    w.emit_u32(FILE_ALIGN as u32);
    w.emit_u16(6); // OS major
    w.emit_u16(0);
    w.emit_u16(0); // image version
    w.emit_u16(0);
    w.emit_u16(6); // subsystem major
    w.emit_u16(0);
    w.emit_u32(0); // win32 version
    w.emit_u32(image_end as u32);
    w.emit_u32(headers_size as u32);
    w.emit_u32(0); // checksum
    w.emit_u16(IMAGE_SUBSYSTEM_WINDOWS_CUI);
    w.emit_u16(IMAGE_DLLCHARACTERISTICS_NX_COMPAT | IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE);
    w.emit_u64(0x10_0000); // stack reserve
    w.emit_u64(0x1000); // stack commit
    w.emit_u64(0x10_0000); // heap reserve
    w.emit_u64(0x1000); // heap commit
    w.emit_u32(0); // loader flags
    w.emit_u32(16); // data directories
    w.emit_bytes(&[0u8; 128]);

    // Section table
    for (section, &raw_offset) in sections.iter().zip(&raw_offsets) {
        w.emit_name(&section.name, 8);
        w.emit_u32(section.size as u32); // virtual size
        w.emit_u32((section.vaddr - IMAGE_BASE) as u32);
        if section.kind == SectionKind::Bss {
            w.emit_u32(0);
            w.emit_u32(0);
        } else {
            w.emit_u32(align_up(section.size, FILE_ALIGN) as u32);
            w.emit_u32(raw_offset as u32);
        }
        w.emit_u32(0); // relocations
        w.emit_u32(0); // line numbers
        w.emit_u16(0);
        w.emit_u16(0);
        w.emit_u32(section_characteristics(section));
    }

    let mut bytes = w.into_bytes();
    bytes.resize(headers_size as usize, 0);

    for (section, &raw_offset) in sections.iter().zip(&raw_offsets) {
        if section.kind == SectionKind::Bss {
            continue;
        }
        bytes.resize(raw_offset as usize, 0);
        bytes.extend_from_slice(&section.data);
        bytes.resize(align_up(bytes.len() as u64, FILE_ALIGN) as usize, 0);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::{Linker, OutputFormat};
    use smallc_object::{Arch, Object, SymbolBinding};

    fn image() -> crate::linker::LinkedImage {
        let mut obj = Object::new(Arch::X64);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.sections[text].data = vec![0xB8, 0x2A, 0, 0, 0, 0xC3];
        obj.sections[text].size = 6;
        let data = obj.add_section(".data", SectionKind::Data, 8);
        obj.sections[data].data = vec![1; 8];
        obj.sections[data].size = 8;
        obj.add_symbol("mainCRTStartup", Some(text), 0, SymbolBinding::Global);
        let mut linker = Linker::new();
        linker.add_object(&obj, "a.obj").unwrap();
        linker.link(OutputFormat::Pe).unwrap()
    }

    #[test]
    fn test_dos_stub_and_signature() {
        let bytes = image().bytes;
        assert_eq!(&bytes[..2], b"MZ");
        let e_lfanew = u32::from_le_bytes(bytes[0x3C..0x40].try_into().unwrap());
        assert_eq!(e_lfanew, 0x80);
        assert_eq!(&bytes[0x80..0x84], b"PE\0\0");
    }

    #[test]
    fn test_coff_and_optional_header() {
        let image = image();
        let bytes = &image.bytes;
        let coff = 0x84;
        assert_eq!(
            u16::from_le_bytes(bytes[coff..coff + 2].try_into().unwrap()),
            IMAGE_FILE_MACHINE_AMD64
        );
        let opt = coff + 20;
        assert_eq!(
            u16::from_le_bytes(bytes[opt..opt + 2].try_into().unwrap()),
            0x20B
        );
        let entry_rva = u32::from_le_bytes(bytes[opt + 16..opt + 20].try_into().unwrap());
        assert_eq!(entry_rva as u64, image.entry - IMAGE_BASE);
        let image_base = u64::from_le_bytes(bytes[opt + 24..opt + 32].try_into().unwrap());
        assert_eq!(image_base, IMAGE_BASE);
    }

    #[test]
    fn test_section_payload_on_file_alignment() {
        let image = image();
        let bytes = &image.bytes;
        // First section's raw pointer from the section table
        let section_table = 0x84 + 20 + OPTIONAL_HEADER_SIZE as usize;
        let raw_ptr = u32::from_le_bytes(
            bytes[section_table + 20..section_table + 24].try_into().unwrap(),
        ) as usize;
        assert_eq!(raw_ptr as u64 % FILE_ALIGN, 0);
        assert_eq!(&bytes[raw_ptr..raw_ptr + 6], &[0xB8, 0x2A, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn test_entry_prefers_maincrtstartup() {
        let image = image();
        assert_eq!(image.entry, IMAGE_BASE + PAGE_SIZE);
    }
}
