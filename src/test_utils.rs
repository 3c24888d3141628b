//! Synthetic ELF objects for tests.

use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
    write::{Object, SectionId, Symbol, SymbolSection},
};

use crate::btf::PERCPU_SECTION;

/// Builds a relocatable ELF64 object in memory. Section addresses are zero,
/// so symbol values double as the "virtual addresses" the encoder sees.
pub(crate) struct TestObject {
    object: Object<'static>,
}

impl TestObject {
    pub(crate) fn new() -> Self {
        Self {
            object: Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little),
        }
    }

    pub(crate) fn add_section(&mut self, name: &str, data: Vec<u8>) -> SectionId {
        let section =
            self.object
                .add_section(Vec::new(), name.as_bytes().to_vec(), SectionKind::Data);
        self.object.set_section_data(section, data, 8);
        section
    }

    pub(crate) fn add_symbol(
        &mut self,
        name: &str,
        value: u64,
        size: u64,
        kind: SymbolKind,
        section: SymbolSection,
    ) {
        self.object.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind,
            scope: SymbolScope::Dynamic,
            weak: false,
            section,
            flags: SymbolFlags::None,
        });
    }

    pub(crate) fn add_function(&mut self, name: &str, value: u64, section: SectionId) {
        self.add_symbol(
            name,
            value,
            0,
            SymbolKind::Text,
            SymbolSection::Section(section),
        );
    }

    pub(crate) fn add_object(&mut self, name: &str, value: u64, size: u64, section: SectionId) {
        self.add_symbol(
            name,
            value,
            size,
            SymbolKind::Data,
            SymbolSection::Section(section),
        );
    }

    pub(crate) fn add_percpu_section(&mut self, size: usize) -> SectionId {
        self.add_section(PERCPU_SECTION, vec![0; size])
    }

    /// Adds an mcount location table plus the six kernel layout anchors. The
    /// table is padded by eight bytes so `__start_mcount_loc` stays off
    /// address zero.
    pub(crate) fn add_kernel_layout(
        &mut self,
        mcount_addrs: &[u64],
        init: (u64, u64),
        bpf_init: (u64, u64),
    ) {
        let mut data = vec![0u8; 8];
        for addr in mcount_addrs {
            data.extend(addr.to_le_bytes());
        }
        let start = 8;
        let stop = start + 8 * mcount_addrs.len() as u64;
        let section = self.add_section("__mcount_loc", data);
        self.add_symbol(
            "__start_mcount_loc",
            start,
            0,
            SymbolKind::Data,
            SymbolSection::Section(section),
        );
        self.add_symbol(
            "__stop_mcount_loc",
            stop,
            0,
            SymbolKind::Data,
            SymbolSection::Absolute,
        );
        self.add_symbol(
            "__init_begin",
            init.0,
            0,
            SymbolKind::Data,
            SymbolSection::Absolute,
        );
        self.add_symbol(
            "__init_end",
            init.1,
            0,
            SymbolKind::Data,
            SymbolSection::Absolute,
        );
        self.add_symbol(
            "__init_bpf_preserve_type_begin",
            bpf_init.0,
            0,
            SymbolKind::Data,
            SymbolSection::Absolute,
        );
        self.add_symbol(
            "__init_bpf_preserve_type_end",
            bpf_init.1,
            0,
            SymbolKind::Data,
            SymbolSection::Absolute,
        );
    }

    pub(crate) fn build(self) -> Vec<u8> {
        self.object.write().unwrap()
    }
}
