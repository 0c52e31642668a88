//! ARM ELF relocatable export of generated kernels.
//!
//! Each kernel becomes a global Thumb function symbol in `.text`, so the object can be
//! linked into firmware or inspected with `objdump -d`. The symbol value carries the
//! Thumb bit and a `$t` mapping symbol marks the code as Thumb for disassemblers.

use log::debug;
use object::elf::EF_ARM_EABI_VER5;
use object::write::{Object, StandardSegment, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, FileFlags, SectionKind, SymbolFlags, SymbolKind,
    SymbolScope,
};

/// Functions are word aligned in the section.
const FUNCTION_ALIGN: u64 = 4;

/// Build an object holding each `(name, code)` pair as a function.
pub fn write_object(functions: &[(&str, &[u16])]) -> Result<Vec<u8>, object::write::Error> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Arm, Endianness::Little);
    obj.flags = FileFlags::Elf {
        os_abi: 0,
        abi_version: 0,
        e_flags: EF_ARM_EABI_VER5,
    };
    let text = obj.add_section(
        obj.segment_name(StandardSegment::Text).to_vec(),
        b".text".to_vec(),
        SectionKind::Text,
    );

    for &(name, code) in functions {
        let bytes: Vec<u8> = code.iter().flat_map(|hw| hw.to_le_bytes()).collect();
        let offset = obj.append_section_data(text, &bytes, FUNCTION_ALIGN);
        debug!("{name}: {} bytes at .text+{offset:#x}", bytes.len());
        obj.add_symbol(Symbol {
            name: b"$t".to_vec(),
            value: offset,
            size: 0,
            kind: SymbolKind::Label,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset | 1,
            size: bytes.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    obj.write()
}
