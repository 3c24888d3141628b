//! Read access to the ELF object being encoded.
//!
//! The encoder only needs a narrow slice of the object file: symbol table
//! iteration, section lookup by index and by name, and the class/endianness
//! queries required to interpret raw section contents. This module wraps
//! [`object`] behind exactly that interface so the rest of the crate never
//! touches the parser directly.

use object::{
    SymbolKind,
    read::{File, Object as _, ObjectSection as _, ObjectSymbol as _},
};

/// The error type returned when object file access fails.
#[derive(thiserror::Error, Debug)]
pub enum ElfError {
    /// The file could not be parsed as an ELF object.
    #[error("error parsing ELF object")]
    Parse(#[source] object::read::Error),

    /// A section referenced by index does not exist.
    #[error("failed to get section({index}) header")]
    SectionHeader {
        /// section index
        index: usize,
        /// source of the error
        #[source]
        source: object::read::Error,
    },

    /// A section exists but its contents could not be read.
    #[error("failed to get section({index}) data")]
    SectionData {
        /// section index
        index: usize,
        /// source of the error
        #[source]
        source: object::read::Error,
    },
}

/// One entry of the object's symbol table.
///
/// The name borrows directly from the mapped object data and stays valid for
/// as long as the object bytes do.
#[derive(Clone, Copy, Debug)]
pub struct ElfSymbol<'data> {
    /// Symbol name, empty when the symbol is unnamed.
    pub name: &'data str,
    /// Symbol value, a virtual address for linked objects.
    pub address: u64,
    /// Symbol size in bytes.
    pub size: u64,
    /// Index of the section the symbol is defined in, if any.
    pub section: Option<usize>,
    /// The symbol type.
    pub kind: SymbolKind,
}

/// Location of a named section within the object.
#[derive(Clone, Copy, Debug)]
pub struct SectionInfo {
    /// Section index.
    pub index: usize,
    /// Virtual address of the section.
    pub address: u64,
    /// Section size in bytes.
    pub size: u64,
}

/// A parsed ELF object.
pub struct ElfObject<'data> {
    file: File<'data>,
}

impl<'data> ElfObject<'data> {
    /// Parses the raw bytes of an object file.
    pub fn parse(data: &'data [u8]) -> Result<Self, ElfError> {
        let file = File::parse(data).map_err(ElfError::Parse)?;
        Ok(Self { file })
    }

    /// Iterates over the symbol table.
    pub fn symbols(&self) -> impl Iterator<Item = ElfSymbol<'data>> + '_ {
        self.file.symbols().map(|sym| ElfSymbol {
            name: sym.name().unwrap_or(""),
            address: sym.address(),
            size: sym.size(),
            section: sym.section_index().map(|index| index.0),
            kind: sym.kind(),
        })
    }

    /// Returns the virtual address and raw contents of the section at `index`.
    pub fn section_data(&self, index: usize) -> Result<(u64, &'data [u8]), ElfError> {
        let section = self
            .file
            .section_by_index(object::SectionIndex(index))
            .map_err(|source| ElfError::SectionHeader { index, source })?;
        let data = section
            .data()
            .map_err(|source| ElfError::SectionData { index, source })?;
        Ok((section.address(), data))
    }

    /// Looks a section up by name.
    pub fn section_by_name(&self, name: &str) -> Option<SectionInfo> {
        let section = self.file.section_by_name(name)?;
        Some(SectionInfo {
            index: section.index().0,
            address: section.address(),
            size: section.size(),
        })
    }

    /// Whether the object carries a symbol table at all.
    pub fn has_symtab(&self) -> bool {
        self.file.symbol_table().is_some()
    }

    /// Whether this is a 64-bit object.
    pub fn is_64(&self) -> bool {
        self.file.is_64()
    }

    /// Whether the object is little-endian.
    pub fn is_little_endian(&self) -> bool {
        self.file.is_little_endian()
    }
}
