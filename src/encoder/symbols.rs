//! Symbol-table scanning for the encoder.
//!
//! One pass over the object's symbol table populates three things: the
//! function table used to restrict FUNC emission to ftrace-traceable
//! kernel functions, the per-CPU variable index, and the six layout anchor
//! addresses that gate the whole function filter.

use log::{debug, warn};
use object::SymbolKind;

use crate::{
    elf::{ElfObject, ElfSymbol},
    encoder::{EncodeError, name_valid},
};

pub(super) const MAX_PERCPU_VARS: usize = 4096;

/// A function symbol eligible for BTF emission.
#[derive(Clone, Copy, Debug)]
pub(super) struct ElfFunction<'data> {
    pub(super) name: &'data str,
    pub(super) addr: u64,
    pub(super) generated: bool,
}

/// A per-CPU variable, keyed by address.
#[derive(Clone, Copy, Debug)]
pub(super) struct VarInfo<'data> {
    pub(super) addr: u64,
    pub(super) size: u32,
    pub(super) name: &'data str,
}

/// Anchor addresses scraped from well-known kernel symbols. The function
/// filter only activates when all six are present.
#[derive(Debug, Default)]
pub(super) struct FuncsLayout {
    mcount_start: u64,
    mcount_stop: u64,
    init_begin: u64,
    init_end: u64,
    init_bpf_begin: u64,
    init_bpf_end: u64,
    mcount_sec_idx: usize,
}

impl FuncsLayout {
    fn record(&mut self, sym: &ElfSymbol<'_>) {
        if self.mcount_start == 0 && sym.name == "__start_mcount_loc" {
            self.mcount_start = sym.address;
            self.mcount_sec_idx = sym.section.unwrap_or(0);
        }
        if self.mcount_stop == 0 && sym.name == "__stop_mcount_loc" {
            self.mcount_stop = sym.address;
        }
        if self.init_begin == 0 && sym.name == "__init_begin" {
            self.init_begin = sym.address;
        }
        if self.init_end == 0 && sym.name == "__init_end" {
            self.init_end = sym.address;
        }
        if self.init_bpf_begin == 0 && sym.name == "__init_bpf_preserve_type_begin" {
            self.init_bpf_begin = sym.address;
        }
        if self.init_bpf_end == 0 && sym.name == "__init_bpf_preserve_type_end" {
            self.init_bpf_end = sym.address;
        }
    }

    fn has_all_symbols(&self) -> bool {
        self.mcount_start != 0
            && self.mcount_stop != 0
            && self.init_begin != 0
            && self.init_end != 0
            && self.init_bpf_begin != 0
            && self.init_bpf_end != 0
    }

    fn is_init(&self, addr: u64) -> bool {
        addr >= self.init_begin && addr < self.init_end
    }

    fn is_bpf_init(&self, addr: u64) -> bool {
        addr >= self.init_bpf_begin && addr < self.init_bpf_end
    }
}

/// The collector's output.
#[derive(Debug, Default)]
pub(super) struct SymbolTables<'data> {
    /// Traceable functions, sorted by name. Empty when the kernel layout was
    /// not detected; the driver then falls back to debug-info selection.
    pub(super) functions: Vec<ElfFunction<'data>>,
    /// Per-CPU variables, sorted by address.
    pub(super) percpu_vars: Vec<VarInfo<'data>>,
}

fn collect_function<'data>(functions: &mut Vec<ElfFunction<'data>>, sym: &ElfSymbol<'data>) {
    if sym.kind != SymbolKind::Text {
        return;
    }
    if sym.address == 0 {
        return;
    }

    // grows from 1000 entries by a factor of 3/2
    if functions.len() == functions.capacity() {
        let target = usize::max(1000, functions.capacity() * 3 / 2);
        functions.reserve_exact(target - functions.len());
    }

    functions.push(ElfFunction {
        name: sym.name,
        addr: sym.address,
        generated: false,
    });
}

fn collect_percpu_var<'data>(
    percpu_vars: &mut Vec<VarInfo<'data>>,
    percpu_shndx: usize,
    sym: &ElfSymbol<'data>,
    verbose: bool,
    force: bool,
) -> Result<(), EncodeError> {
    // a symbol's section index decides whether it's a per-CPU variable
    if sym.section != Some(percpu_shndx) {
        return Ok(());
    }
    if sym.kind != SymbolKind::Data {
        return Ok(());
    }

    // Store only symbols with allocated space in the per-CPU section. This
    // excludes addressable markers, unique-id symbols and exit calls, which
    // are emitted at address zero, and zero-sized symbols.
    let addr = sym.address;
    if addr == 0 {
        return Ok(());
    }
    let size = sym.size;
    if size == 0 {
        return Ok(());
    }

    if !name_valid(sym.name) {
        if force {
            warn!(
                "found symbol of invalid name when encoding, ignored (sym: '{}')",
                sym.name
            );
            return Ok(());
        }
        return Err(EncodeError::InvalidSymbolName {
            name: sym.name.to_string(),
        });
    }

    if verbose {
        debug!("found per-CPU symbol '{}' at address {:#x}", sym.name, addr);
    }

    if percpu_vars.len() == MAX_PERCPU_VARS {
        return Err(EncodeError::PercpuTableFull {
            limit: MAX_PERCPU_VARS,
        });
    }
    percpu_vars.push(VarInfo {
        addr,
        size: size as u32,
        name: sym.name,
    });

    Ok(())
}

/// Walks the symbol table once, classifying symbols into functions, per-CPU
/// variables and layout anchors.
pub(super) fn collect_symbols<'data>(
    elf: &ElfObject<'data>,
    percpu_shndx: Option<usize>,
    collect_percpu_vars: bool,
    verbose: bool,
    force: bool,
) -> Result<SymbolTables<'data>, EncodeError> {
    let mut layout = FuncsLayout::default();
    let mut tables = SymbolTables::default();

    for sym in elf.symbols() {
        if collect_percpu_vars {
            if let Some(percpu_shndx) = percpu_shndx {
                collect_percpu_var(&mut tables.percpu_vars, percpu_shndx, &sym, verbose, force)?;
            }
        }
        collect_function(&mut tables.functions, &sym);
        layout.record(&sym);
    }

    if collect_percpu_vars {
        tables.percpu_vars.sort_by_key(|var| var.addr);
        if verbose {
            debug!("found {} per-CPU variables", tables.percpu_vars.len());
        }
    }

    if !tables.functions.is_empty() && layout.has_all_symbols() {
        tables.functions.sort_by(|a, b| a.name.cmp(b.name));
        filter_functions(elf, &layout, &mut tables.functions)?;
        if verbose {
            debug!("found {} traceable functions", tables.functions.len());
        }
    } else {
        if verbose {
            debug!("kernel layout not detected, falling back to debug info");
        }
        tables.functions.clear();
    }

    Ok(tables)
}

fn read_addr(chunk: &[u8], little_endian: bool) -> u64 {
    let mut value = 0u64;
    if little_endian {
        for b in chunk.iter().rev() {
            value = value << 8 | u64::from(*b);
        }
    } else {
        for b in chunk.iter() {
            value = value << 8 | u64::from(*b);
        }
    }
    value
}

/// Drops collected functions that are not instrumented by ftrace, along
/// with init-section functions outside the preserve-type range. Compaction
/// keeps the table name-sorted.
fn filter_functions<'data>(
    elf: &ElfObject<'data>,
    layout: &FuncsLayout,
    functions: &mut Vec<ElfFunction<'data>>,
) -> Result<(), EncodeError> {
    let (section_addr, data) = elf.section_data(layout.mcount_sec_idx)?;

    // entries are native pointer width for the object's class
    let entry_size = if elf.is_64() { 8 } else { 4 };
    let table = layout
        .mcount_start
        .checked_sub(section_addr)
        .map(|offset| offset as usize)
        .and_then(|offset| {
            let len = (layout.mcount_stop - layout.mcount_start) as usize;
            data.get(offset..offset + len)
        })
        .ok_or(EncodeError::InvalidMcountTable {
            section: layout.mcount_sec_idx,
        })?;

    let little_endian = elf.is_little_endian();
    let mut addrs: Vec<u64> = table
        .chunks_exact(entry_size)
        .map(|chunk| read_addr(chunk, little_endian))
        .collect();
    addrs.sort_unstable();

    functions.retain(|func| {
        // .init functions are not emitted, except the
        // .init.bpf.preserve_type range
        if layout.is_init(func.addr) && !layout.is_bpf_init(func.addr) {
            return false;
        }
        addrs.binary_search(&func.addr).is_ok()
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_utils::TestObject;

    fn kernel_fixture() -> TestObject {
        let mut fixture = TestObject::new();
        let text = fixture.add_section(".text", Vec::new());
        fixture.add_function("traced", 0x1000, text);
        fixture.add_function("early_setup", 0x2000, text);
        fixture.add_function("bpf_preserved", 0x2850, text);
        fixture.add_function("untraced", 0x1100, text);
        fixture
    }

    #[test]
    fn test_filter_keeps_traced_and_bpf_preserved() {
        let mut fixture = kernel_fixture();
        fixture.add_kernel_layout(&[0x1000, 0x2000, 0x2850], (0x2000, 0x3000), (0x2800, 0x2900));
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();

        let tables = collect_symbols(&elf, None, false, false, false).unwrap();
        let names: Vec<_> = tables.functions.iter().map(|f| f.name).collect();
        // name order is preserved by compaction; early_setup is init-only,
        // untraced has no mcount record
        assert_eq!(names, ["bpf_preserved", "traced"]);
    }

    #[test]
    fn test_incomplete_layout_discards_functions() {
        let fixture = kernel_fixture();
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();

        let tables = collect_symbols(&elf, None, false, false, false).unwrap();
        assert!(tables.functions.is_empty());
    }

    #[test]
    fn test_zero_address_functions_are_skipped() {
        let mut fixture = TestObject::new();
        let text = fixture.add_section(".text", Vec::new());
        fixture.add_function("discarded", 0, text);
        fixture.add_function("kept", 0x1000, text);
        fixture.add_kernel_layout(&[0x1000], (0x2000, 0x3000), (0x2800, 0x2900));
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();

        let tables = collect_symbols(&elf, None, false, false, false).unwrap();
        let names: Vec<_> = tables.functions.iter().map(|f| f.name).collect();
        assert_eq!(names, ["kept"]);
    }

    #[test]
    fn test_percpu_vars_sorted_by_address() {
        let mut fixture = TestObject::new();
        let percpu = fixture.add_percpu_section(0x100);
        fixture.add_object("runqueues", 0x80, 8, percpu);
        fixture.add_object("cpu_number", 0x40, 4, percpu);
        fixture.add_object("__exitcall_marker", 0, 8, percpu);
        fixture.add_object("zero_sized", 0x20, 0, percpu);
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();
        let shndx = elf.section_by_name(".data..percpu").unwrap().index;

        let tables = collect_symbols(&elf, Some(shndx), true, false, false).unwrap();
        let vars: Vec<_> = tables
            .percpu_vars
            .iter()
            .map(|v| (v.name, v.addr, v.size))
            .collect();
        assert_eq!(vars, [("cpu_number", 0x40, 4), ("runqueues", 0x80, 8)]);
    }

    #[test]
    fn test_invalid_percpu_name_is_fatal_unless_forced() {
        let mut fixture = TestObject::new();
        let percpu = fixture.add_percpu_section(0x100);
        fixture.add_object("bad$name", 0x10, 8, percpu);
        fixture.add_object("fine", 0x20, 8, percpu);
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();
        let shndx = elf.section_by_name(".data..percpu").unwrap().index;

        assert_matches!(
            collect_symbols(&elf, Some(shndx), true, false, false),
            Err(EncodeError::InvalidSymbolName { name }) if name == "bad$name"
        );

        let tables = collect_symbols(&elf, Some(shndx), true, false, true).unwrap();
        let names: Vec<_> = tables.percpu_vars.iter().map(|v| v.name).collect();
        assert_eq!(names, ["fine"]);
    }

    #[test]
    fn test_percpu_table_overflow() {
        let mut fixture = TestObject::new();
        let percpu = fixture.add_percpu_section(0x10000);
        for i in 0..MAX_PERCPU_VARS + 1 {
            fixture.add_object(&format!("var_{i}"), 8 * (i as u64 + 1), 8, percpu);
        }
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();
        let shndx = elf.section_by_name(".data..percpu").unwrap().index;

        assert_matches!(
            collect_symbols(&elf, Some(shndx), true, false, false),
            Err(EncodeError::PercpuTableFull { limit: MAX_PERCPU_VARS })
        );
    }

    #[test]
    fn test_mcount_table_out_of_bounds() {
        let mut fixture = TestObject::new();
        let text = fixture.add_section(".text", Vec::new());
        fixture.add_function("traced", 0x1000, text);
        // the mcount section holds one entry but the anchors claim two
        let mut data = vec![0u8; 8];
        data.extend(0x1000u64.to_le_bytes());
        let section = fixture.add_section("__mcount_loc", data);
        fixture.add_symbol(
            "__start_mcount_loc",
            8,
            0,
            object::SymbolKind::Data,
            object::write::SymbolSection::Section(section),
        );
        fixture.add_symbol(
            "__stop_mcount_loc",
            24,
            0,
            object::SymbolKind::Data,
            object::write::SymbolSection::Absolute,
        );
        for (name, value) in [
            ("__init_begin", 0x2000),
            ("__init_end", 0x3000),
            ("__init_bpf_preserve_type_begin", 0x2800),
            ("__init_bpf_preserve_type_end", 0x2900),
        ] {
            fixture.add_symbol(
                name,
                value,
                0,
                object::SymbolKind::Data,
                object::write::SymbolSection::Absolute,
            );
        }
        let bytes = fixture.build();
        let elf = ElfObject::parse(&bytes).unwrap();

        assert_matches!(
            collect_symbols(&elf, None, false, false, false),
            Err(EncodeError::InvalidMcountTable { .. })
        );
    }

    #[test]
    fn test_read_addr_endianness() {
        let bytes = [0x10, 0x20, 0, 0, 0, 0, 0, 0];
        assert_eq!(read_addr(&bytes, true), 0x2010);
        assert_eq!(read_addr(&bytes, false), 0x1020_0000_0000_0000);
    }
}
