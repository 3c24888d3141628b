use core::mem;

use bytes::BufMut;

use crate::{
    btf::{
        Array, BtfKind, BtfMember, BtfParam, BtfType, Const, DataSec, DataSecEntry, Enum, Func,
        FuncProto, Fwd, Int, IntEncoding, Ptr, Restrict, Struct, Typedef, Union, Var, VarLinkage,
        Volatile,
    },
    cu::{BaseType, Cu, FuncType},
    elf::{ElfObject, SectionInfo},
    util::bytes_of,
};

/// Name of the section holding per-CPU variables.
pub const PERCPU_SECTION: &str = ".data..percpu";

/// The error type returned when building the BTF table fails.
#[derive(thiserror::Error, Debug)]
pub enum BtfError {
    /// Base types with a float encoding have no BTF representation.
    #[error("float base type `{name}` is not supported")]
    FloatBaseType {
        /// type name
        name: String,
    },

    /// The kind passed to [`BtfWriter::add_ref_type`] is not a reference kind.
    #[error("{kind} is not a reference kind")]
    InvalidRefKind {
        /// offending kind
        kind: BtfKind,
    },

    /// The kind passed to [`BtfWriter::add_struct`] is not a composite kind.
    #[error("{kind} is not a composite kind")]
    InvalidCompositeKind {
        /// offending kind
        kind: BtfKind,
    },

    /// A member was added but the last type is not a struct or union.
    #[error("member added with no struct or union in progress")]
    DanglingMember,

    /// An enumerator was added but the last type is not an enum.
    #[error("enumerator added with no enum in progress")]
    DanglingEnumerator,

    /// A DATASEC was requested on an object without a per-CPU section.
    #[error("object has no per-CPU section")]
    MissingPercpuSection,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct BtfHeader {
    magic: u16,
    version: u8,
    flags: u8,
    hdr_len: u32,
    type_off: u32,
    type_len: u32,
    str_off: u32,
    str_len: u32,
}

/// The accumulating BTF type and string tables.
///
/// Type IDs are 1-based; ID 0 is the implicit `void` type and never appears
/// in the table. The table is append-only and serializes with [`Btf::to_bytes`].
#[derive(Clone, Debug)]
pub struct Btf {
    header: BtfHeader,
    strings: Vec<u8>,
    types: Vec<BtfType>,
}

impl Btf {
    /// Creates a new empty table with its header initialized.
    pub fn new() -> Btf {
        Btf {
            header: BtfHeader {
                magic: 0xeb9f,
                version: 0x01,
                flags: 0x00,
                hdr_len: 0x18,
                type_off: 0x00,
                type_len: 0x00,
                str_off: 0x00,
                str_len: 0x01,
            },
            strings: vec![0],
            types: Vec::new(),
        }
    }

    /// Adds a string, returning its offset into the string section.
    pub fn add_string(&mut self, name: &str) -> u32 {
        let name_offset = self.strings.len();
        self.strings.extend(name.as_bytes());
        self.strings.push(0);
        self.header.str_len = self.strings.len() as u32;
        name_offset as u32
    }

    /// Adds a type, returning its ID.
    pub fn add_type(&mut self, btf_type: BtfType) -> u32 {
        let size = btf_type.type_info_size() as u32;
        self.types.push(btf_type);
        self.header.type_len += size;
        self.header.str_off += size;
        self.types.len() as u32
    }

    /// Number of types in the table, not counting `void`.
    pub fn type_count(&self) -> u32 {
        self.types.len() as u32
    }

    fn last_type_mut(&mut self) -> Option<&mut BtfType> {
        self.types.last_mut()
    }

    /// Serializes the table into the kernel's BTF format.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Safety: BtfHeader is POD
        let mut buf = unsafe { bytes_of::<BtfHeader>(&self.header).to_vec() };
        for t in self.types.iter() {
            buf.extend(t.to_bytes());
        }
        buf.put(self.strings.as_slice());
        buf
    }
}

impl Default for Btf {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-object encoding state: the BTF table under construction plus what the
/// object file contributes to it.
///
/// One writer lives for the duration of one object's encode session and is
/// discarded once [`BtfWriter::encode`] produced the blob.
pub struct BtfWriter {
    filename: String,
    btf: Btf,
    percpu_secinfo: Vec<DataSecEntry>,
    has_symtab: bool,
    percpu: Option<SectionInfo>,
}

impl BtfWriter {
    /// Creates a writer for the object `filename`, optionally seeded with an
    /// already-encoded base table whose IDs the new types continue.
    pub fn new(filename: &str, elf: &ElfObject<'_>, base_btf: Option<Btf>) -> BtfWriter {
        BtfWriter {
            filename: filename.to_string(),
            btf: base_btf.unwrap_or_default(),
            percpu_secinfo: Vec::new(),
            has_symtab: elf.has_symtab(),
            percpu: elf.section_by_name(PERCPU_SECTION),
        }
    }

    /// The object filename this writer was opened for.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Current number of types, not counting `void`.
    pub fn type_count(&self) -> u32 {
        self.btf.type_count()
    }

    /// The object's per-CPU section, if it has one.
    pub fn percpu_section(&self) -> Option<SectionInfo> {
        self.percpu
    }

    /// Whether the object carries a symbol table.
    pub fn has_symtab(&self) -> bool {
        self.has_symtab
    }

    /// Number of staged per-CPU section-info records.
    pub fn percpu_secinfo_len(&self) -> usize {
        self.percpu_secinfo.len()
    }

    fn intern(&mut self, name: Option<&str>) -> u32 {
        match name {
            Some(name) => self.btf.add_string(name),
            None => 0,
        }
    }

    /// Adds an INT record for a base type.
    pub fn add_base_type(&mut self, bt: &BaseType, name: &str) -> Result<u32, BtfError> {
        let encoding = if bt.is_signed {
            IntEncoding::Signed
        } else if bt.is_bool {
            IntEncoding::Bool
        } else if bt.is_float {
            return Err(BtfError::FloatBaseType {
                name: name.to_string(),
            });
        } else {
            IntEncoding::None
        };
        let name_offset = self.btf.add_string(name);
        let size = bt.bit_size.div_ceil(8);
        let int_type = BtfType::Int(Int::new(name_offset, size, encoding, bt.bit_size));
        Ok(self.btf.add_type(int_type))
    }

    /// Adds one of the reference kinds pointing at `type_id`. The kind flag
    /// is only meaningful for FWD, where it marks a union declaration.
    pub fn add_ref_type(
        &mut self,
        kind: BtfKind,
        type_id: u32,
        name: Option<&str>,
        kind_flag: bool,
    ) -> Result<u32, BtfError> {
        let name_offset = self.intern(name);
        let btf_type = match kind {
            BtfKind::Const => BtfType::Const(Const::new(name_offset, type_id)),
            BtfKind::Ptr => BtfType::Ptr(Ptr::new(name_offset, type_id)),
            BtfKind::Restrict => BtfType::Restrict(Restrict::new(name_offset, type_id)),
            BtfKind::Volatile => BtfType::Volatile(Volatile::new(name_offset, type_id)),
            BtfKind::Typedef => BtfType::Typedef(Typedef::new(name_offset, type_id)),
            BtfKind::Func => BtfType::Func(Func::new(name_offset, type_id)),
            BtfKind::Fwd => BtfType::Fwd(Fwd::new(name_offset, kind_flag)),
            kind => return Err(BtfError::InvalidRefKind { kind }),
        };
        Ok(self.btf.add_type(btf_type))
    }

    /// Opens a STRUCT or UNION record; members follow via
    /// [`BtfWriter::add_member`].
    pub fn add_struct(
        &mut self,
        kind: BtfKind,
        name: Option<&str>,
        size: u32,
    ) -> Result<u32, BtfError> {
        let name_offset = self.intern(name);
        let btf_type = match kind {
            BtfKind::Struct => BtfType::Struct(Struct::new(name_offset, size)),
            BtfKind::Union => BtfType::Union(Union::new(name_offset, size)),
            kind => return Err(BtfError::InvalidCompositeKind { kind }),
        };
        Ok(self.btf.add_type(btf_type))
    }

    /// Appends a member to the composite opened last. The bit offset is
    /// stored unchanged; a nonzero bit-field width packs into the high byte
    /// of the offset word.
    pub fn add_member(
        &mut self,
        name: Option<&str>,
        type_id: u32,
        bitfield_size: u8,
        bit_offset: u32,
    ) -> Result<(), BtfError> {
        let name_offset = self.intern(name);
        let offset = if bitfield_size != 0 {
            (bitfield_size as u32) << 24 | (bit_offset & 0x00FF_FFFF)
        } else {
            bit_offset
        };
        let member = BtfMember {
            name_offset,
            btf_type: type_id,
            offset,
        };
        match self.btf.last_type_mut() {
            Some(BtfType::Struct(t)) => t.push_member(member, bitfield_size != 0),
            Some(BtfType::Union(t)) => t.push_member(member, bitfield_size != 0),
            _ => return Err(BtfError::DanglingMember),
        }
        Ok(())
    }

    /// Adds an ARRAY record.
    pub fn add_array(&mut self, element_type: u32, index_type: u32, nelems: u32) -> u32 {
        self.btf
            .add_type(BtfType::Array(Array::new(element_type, index_type, nelems)))
    }

    /// Opens an ENUM record; enumerators follow via
    /// [`BtfWriter::add_enum_val`].
    pub fn add_enum(&mut self, name: Option<&str>, size: u32) -> u32 {
        let name_offset = self.intern(name);
        self.btf.add_type(BtfType::Enum(Enum::new(name_offset, size)))
    }

    /// Appends an enumerator to the enum opened last.
    pub fn add_enum_val(&mut self, name: Option<&str>, value: u32) -> Result<(), BtfError> {
        let name_offset = self.intern(name);
        match self.btf.last_type_mut() {
            Some(BtfType::Enum(t)) => t.push_variant(name_offset, value),
            _ => return Err(BtfError::DanglingEnumerator),
        }
        Ok(())
    }

    /// Adds a FUNC_PROTO record for `ftype`, mapping parameter and return
    /// core IDs through `type_id_off`. A variadic prototype gets the
    /// terminating unnamed void parameter.
    pub fn add_func_proto(&mut self, cu: &Cu<'_>, ftype: &FuncType, type_id_off: u32) -> u32 {
        let return_type = if ftype.return_type == 0 {
            0
        } else {
            type_id_off + ftype.return_type
        };
        let mut params = Vec::with_capacity(ftype.params.len() + usize::from(ftype.variadic));
        for param in ftype.params.iter() {
            let name_offset = self.intern(cu.string(param.name));
            params.push(BtfParam {
                name_offset,
                btf_type: if param.type_ref == 0 {
                    0
                } else {
                    type_id_off + param.type_ref
                },
            });
        }
        if ftype.variadic {
            params.push(BtfParam {
                name_offset: 0,
                btf_type: 0,
            });
        }
        self.btf
            .add_type(BtfType::FuncProto(FuncProto::new(params, return_type)))
    }

    /// Adds a VAR record.
    pub fn add_var_type(&mut self, type_id: u32, name: &str, linkage: VarLinkage) -> u32 {
        let name_offset = self.btf.add_string(name);
        self.btf
            .add_type(BtfType::Var(Var::new(name_offset, type_id, linkage)))
    }

    /// Stages a section-info record for the per-CPU DATASEC.
    pub fn add_var_secinfo(&mut self, var_id: u32, offset: u32, size: u32) {
        self.percpu_secinfo.push(DataSecEntry {
            btf_type: var_id,
            offset,
            size,
        });
    }

    /// Drains the staged section infos into one DATASEC record sized to the
    /// per-CPU section, entries ordered by offset.
    pub fn add_datasec_type(&mut self, name: &str) -> Result<u32, BtfError> {
        let percpu = self.percpu.ok_or(BtfError::MissingPercpuSection)?;
        let name_offset = self.btf.add_string(name);
        let mut entries = mem::take(&mut self.percpu_secinfo);
        entries.sort_by_key(|entry| entry.offset);
        Ok(self
            .btf
            .add_type(BtfType::DataSec(DataSec::new(
                name_offset,
                entries,
                percpu.size as u32,
            ))))
    }

    /// Serializes the accumulated table.
    pub fn encode(&self) -> Vec<u8> {
        self.btf.to_bytes()
    }
}
