#![expect(missing_docs)]

use core::mem;

/// A single entry of the BTF type table.
///
/// Only the kinds this encoder emits are modelled. Every record knows how to
/// serialize itself into the kernel's on-disk representation; there is no
/// deserializer, the table is write-only.
#[derive(Clone, Debug)]
pub enum BtfType {
    Int(Int),
    Ptr(Ptr),
    Const(Const),
    Volatile(Volatile),
    Restrict(Restrict),
    Typedef(Typedef),
    Fwd(Fwd),
    Array(Array),
    Struct(Struct),
    Union(Union),
    Enum(Enum),
    FuncProto(FuncProto),
    Func(Func),
    Var(Var),
    DataSec(DataSec),
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum BtfKind {
    #[default]
    Unknown = 0,
    Int = 1,
    Ptr = 2,
    Array = 3,
    Struct = 4,
    Union = 5,
    Enum = 6,
    Fwd = 7,
    Typedef = 8,
    Volatile = 9,
    Const = 10,
    Restrict = 11,
    Func = 12,
    FuncProto = 13,
    Var = 14,
    DataSec = 15,
    Float = 16,
    DeclTag = 17,
    TypeTag = 18,
    Enum64 = 19,
}

impl core::fmt::Display for BtfKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unknown => write!(f, "[UNKNOWN]"),
            Self::Int => write!(f, "[INT]"),
            Self::Ptr => write!(f, "[PTR]"),
            Self::Array => write!(f, "[ARRAY]"),
            Self::Struct => write!(f, "[STRUCT]"),
            Self::Union => write!(f, "[UNION]"),
            Self::Enum => write!(f, "[ENUM]"),
            Self::Fwd => write!(f, "[FWD]"),
            Self::Typedef => write!(f, "[TYPEDEF]"),
            Self::Volatile => write!(f, "[VOLATILE]"),
            Self::Const => write!(f, "[CONST]"),
            Self::Restrict => write!(f, "[RESTRICT]"),
            Self::Func => write!(f, "[FUNC]"),
            Self::FuncProto => write!(f, "[FUNC_PROTO]"),
            Self::Var => write!(f, "[VAR]"),
            Self::DataSec => write!(f, "[DATASEC]"),
            Self::Float => write!(f, "[FLOAT]"),
            Self::DeclTag => write!(f, "[DECL_TAG]"),
            Self::TypeTag => write!(f, "[TYPE_TAG]"),
            Self::Enum64 => write!(f, "[ENUM64]"),
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntEncoding {
    None = 0,
    Signed = 1,
    Char = 2,
    Bool = 4,
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct Int {
    pub(crate) name_offset: u32,
    info: u32,
    pub(crate) size: u32,
    pub(crate) data: u32,
}

impl Int {
    pub fn new(name_offset: u32, size: u32, encoding: IntEncoding, nr_bits: u32) -> Self {
        let info = (BtfKind::Int as u32) << 24;
        let mut data = 0u32;
        data |= (encoding as u32 & 0x0f) << 24;
        data |= nr_bits & 0xff;
        Self {
            name_offset,
            info,
            size,
            data,
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        bytes_of::<Self>(self).to_vec()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Self>()
    }
}

macro_rules! ref_kind {
    ($name:ident, $kind:ident) => {
        #[repr(C)]
        #[derive(Clone, Debug)]
        pub struct $name {
            pub(crate) name_offset: u32,
            info: u32,
            pub(crate) btf_type: u32,
        }

        impl $name {
            pub fn new(name_offset: u32, btf_type: u32) -> Self {
                let info = (BtfKind::$kind as u32) << 24;
                Self {
                    name_offset,
                    info,
                    btf_type,
                }
            }

            pub(crate) fn to_bytes(&self) -> Vec<u8> {
                bytes_of::<Self>(self).to_vec()
            }

            pub(crate) fn type_info_size(&self) -> usize {
                mem::size_of::<Self>()
            }
        }
    };
}

ref_kind!(Ptr, Ptr);
ref_kind!(Const, Const);
ref_kind!(Volatile, Volatile);
ref_kind!(Restrict, Restrict);
ref_kind!(Typedef, Typedef);
ref_kind!(Func, Func);

#[repr(C)]
#[derive(Clone, Debug)]
pub struct Fwd {
    pub(crate) name_offset: u32,
    info: u32,
    _unused: u32,
}

impl Fwd {
    /// The kind flag distinguishes a union forward declaration from a struct
    /// one.
    pub fn new(name_offset: u32, is_union: bool) -> Self {
        let mut info = (BtfKind::Fwd as u32) << 24;
        if is_union {
            info |= 1 << 31;
        }
        Self {
            name_offset,
            info,
            _unused: 0,
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        bytes_of::<Self>(self).to_vec()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Self>()
    }

    #[cfg(test)]
    pub(crate) fn is_union(&self) -> bool {
        self.info >> 31 == 1
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct BtfArray {
    pub(crate) element_type: u32,
    pub(crate) index_type: u32,
    pub(crate) len: u32,
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct Array {
    name_offset: u32,
    info: u32,
    _unused: u32,
    pub(crate) array: BtfArray,
}

impl Array {
    pub fn new(element_type: u32, index_type: u32, len: u32) -> Self {
        let info = (BtfKind::Array as u32) << 24;
        Self {
            name_offset: 0,
            info,
            _unused: 0,
            array: BtfArray {
                element_type,
                index_type,
                len,
            },
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let Self {
            name_offset,
            info,
            _unused,
            array,
        } = self;
        [
            bytes_of::<u32>(name_offset),
            bytes_of::<u32>(info),
            bytes_of::<u32>(_unused),
            bytes_of::<BtfArray>(array),
        ]
        .concat()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Self>()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BtfMember {
    pub(crate) name_offset: u32,
    pub(crate) btf_type: u32,
    pub(crate) offset: u32,
}

macro_rules! composite_kind {
    ($name:ident, $kind:ident) => {
        #[derive(Clone, Debug)]
        pub struct $name {
            pub(crate) name_offset: u32,
            info: u32,
            pub(crate) size: u32,
            pub(crate) members: Vec<BtfMember>,
        }

        impl $name {
            pub fn new(name_offset: u32, size: u32) -> Self {
                let info = (BtfKind::$kind as u32) << 24;
                Self {
                    name_offset,
                    info,
                    size,
                    members: Vec::new(),
                }
            }

            /// Appends one member record, bumping the vlen. A bit-field member
            /// switches the composite to kind-flag offset encoding; plain
            /// members are unaffected because their high offset byte is zero.
            pub(crate) fn push_member(&mut self, member: BtfMember, is_bitfield: bool) {
                self.members.push(member);
                self.info = (self.info & 0xFFFF_0000) | (self.members.len() as u32 & 0xFFFF);
                if is_bitfield {
                    self.info |= 1 << 31;
                }
            }

            pub(crate) fn to_bytes(&self) -> Vec<u8> {
                let Self {
                    name_offset,
                    info,
                    size,
                    members,
                } = self;
                [
                    bytes_of::<u32>(name_offset),
                    bytes_of::<u32>(info),
                    bytes_of::<u32>(size),
                ]
                .into_iter()
                .chain(members.iter().flat_map(
                    |BtfMember {
                         name_offset,
                         btf_type,
                         offset,
                     }| {
                        [
                            bytes_of::<u32>(name_offset),
                            bytes_of::<u32>(btf_type),
                            bytes_of::<u32>(offset),
                        ]
                    },
                ))
                .flatten()
                .copied()
                .collect()
            }

            pub(crate) fn type_info_size(&self) -> usize {
                mem::size_of::<Fwd>() + mem::size_of::<BtfMember>() * self.members.len()
            }
        }
    };
}

composite_kind!(Struct, Struct);
composite_kind!(Union, Union);

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BtfEnum {
    pub(crate) name_offset: u32,
    pub(crate) value: u32,
}

#[derive(Clone, Debug)]
pub struct Enum {
    pub(crate) name_offset: u32,
    info: u32,
    pub(crate) size: u32,
    pub(crate) variants: Vec<BtfEnum>,
}

impl Enum {
    pub fn new(name_offset: u32, size: u32) -> Self {
        let info = (BtfKind::Enum as u32) << 24;
        Self {
            name_offset,
            info,
            size,
            variants: Vec::new(),
        }
    }

    pub(crate) fn push_variant(&mut self, name_offset: u32, value: u32) {
        self.variants.push(BtfEnum { name_offset, value });
        self.info = (self.info & 0xFFFF_0000) | (self.variants.len() as u32 & 0xFFFF);
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let Self {
            name_offset,
            info,
            size,
            variants,
        } = self;
        [
            bytes_of::<u32>(name_offset),
            bytes_of::<u32>(info),
            bytes_of::<u32>(size),
        ]
        .into_iter()
        .chain(variants.iter().flat_map(|BtfEnum { name_offset, value }| {
            [bytes_of::<u32>(name_offset), bytes_of::<u32>(value)]
        }))
        .flatten()
        .copied()
        .collect()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Fwd>() + mem::size_of::<BtfEnum>() * self.variants.len()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BtfParam {
    pub name_offset: u32,
    pub btf_type: u32,
}

#[derive(Clone, Debug)]
pub struct FuncProto {
    name_offset: u32,
    info: u32,
    pub(crate) return_type: u32,
    pub(crate) params: Vec<BtfParam>,
}

impl FuncProto {
    pub fn new(params: Vec<BtfParam>, return_type: u32) -> Self {
        let mut info = (BtfKind::FuncProto as u32) << 24;
        info |= (params.len() as u32) & 0xFFFF;
        Self {
            name_offset: 0,
            info,
            return_type,
            params,
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let Self {
            name_offset,
            info,
            return_type,
            params,
        } = self;
        [
            bytes_of::<u32>(name_offset),
            bytes_of::<u32>(info),
            bytes_of::<u32>(return_type),
        ]
        .into_iter()
        .chain(params.iter().flat_map(
            |BtfParam {
                 name_offset,
                 btf_type,
             }| { [bytes_of::<u32>(name_offset), bytes_of::<u32>(btf_type)] },
        ))
        .flatten()
        .copied()
        .collect()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Fwd>() + mem::size_of::<BtfParam>() * self.params.len()
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VarLinkage {
    Static = 0,
    GlobalAllocated = 1,
    GlobalExtern = 2,
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct Var {
    pub(crate) name_offset: u32,
    info: u32,
    pub(crate) btf_type: u32,
    pub(crate) linkage: VarLinkage,
}

impl Var {
    pub fn new(name_offset: u32, btf_type: u32, linkage: VarLinkage) -> Self {
        let info = (BtfKind::Var as u32) << 24;
        Self {
            name_offset,
            info,
            btf_type,
            linkage,
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let Self {
            name_offset,
            info,
            btf_type,
            linkage,
        } = self;
        [
            bytes_of::<u32>(name_offset),
            bytes_of::<u32>(info),
            bytes_of::<u32>(btf_type),
            bytes_of::<VarLinkage>(linkage),
        ]
        .concat()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Fwd>() + mem::size_of::<u32>()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DataSecEntry {
    pub btf_type: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug)]
pub struct DataSec {
    pub(crate) name_offset: u32,
    info: u32,
    pub(crate) size: u32,
    pub(crate) entries: Vec<DataSecEntry>,
}

impl DataSec {
    pub fn new(name_offset: u32, entries: Vec<DataSecEntry>, size: u32) -> Self {
        let mut info = (BtfKind::DataSec as u32) << 24;
        info |= (entries.len() as u32) & 0xFFFF;
        Self {
            name_offset,
            info,
            size,
            entries,
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let Self {
            name_offset,
            info,
            size,
            entries,
        } = self;
        [
            bytes_of::<u32>(name_offset),
            bytes_of::<u32>(info),
            bytes_of::<u32>(size),
        ]
        .into_iter()
        .chain(entries.iter().flat_map(
            |DataSecEntry {
                 btf_type,
                 offset,
                 size,
             }| {
                [
                    bytes_of::<u32>(btf_type),
                    bytes_of::<u32>(offset),
                    bytes_of::<u32>(size),
                ]
            },
        ))
        .flatten()
        .copied()
        .collect()
    }

    pub(crate) fn type_info_size(&self) -> usize {
        mem::size_of::<Fwd>() + mem::size_of::<DataSecEntry>() * self.entries.len()
    }
}

impl BtfType {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Int(t) => t.to_bytes(),
            Self::Ptr(t) => t.to_bytes(),
            Self::Const(t) => t.to_bytes(),
            Self::Volatile(t) => t.to_bytes(),
            Self::Restrict(t) => t.to_bytes(),
            Self::Typedef(t) => t.to_bytes(),
            Self::Fwd(t) => t.to_bytes(),
            Self::Array(t) => t.to_bytes(),
            Self::Struct(t) => t.to_bytes(),
            Self::Union(t) => t.to_bytes(),
            Self::Enum(t) => t.to_bytes(),
            Self::FuncProto(t) => t.to_bytes(),
            Self::Func(t) => t.to_bytes(),
            Self::Var(t) => t.to_bytes(),
            Self::DataSec(t) => t.to_bytes(),
        }
    }

    pub(crate) fn type_info_size(&self) -> usize {
        match self {
            Self::Int(t) => t.type_info_size(),
            Self::Ptr(t) => t.type_info_size(),
            Self::Const(t) => t.type_info_size(),
            Self::Volatile(t) => t.type_info_size(),
            Self::Restrict(t) => t.type_info_size(),
            Self::Typedef(t) => t.type_info_size(),
            Self::Fwd(t) => t.type_info_size(),
            Self::Array(t) => t.type_info_size(),
            Self::Struct(t) => t.type_info_size(),
            Self::Union(t) => t.type_info_size(),
            Self::Enum(t) => t.type_info_size(),
            Self::FuncProto(t) => t.type_info_size(),
            Self::Func(t) => t.type_info_size(),
            Self::Var(t) => t.type_info_size(),
            Self::DataSec(t) => t.type_info_size(),
        }
    }
}

fn bytes_of<T>(val: &T) -> &[u8] {
    // Safety: every record here is POD
    unsafe { crate::util::bytes_of(val) }
}
