//! The debug-information model the encoder consumes.
//!
//! A [`Cu`] is one compilation unit as produced by a DWARF loader: a dense,
//! 1-based table of type [`Tag`]s, the functions and variables declared in
//! the unit, and a private string table. The *core ID* of a tag is its
//! position in the type table; reference fields between tags are expressed
//! in core IDs, with 0 standing for `void`.

use std::collections::HashMap;

use crate::elf::ElfObject;

/// Opaque handle into a unit's string table.
///
/// The zero handle resolves to nothing and marks anonymous entries
/// (unnamed struct members, unnamed parameters).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StringId(u32);

/// Interned strings private to one compilation unit.
#[derive(Debug, Default)]
pub struct Strings {
    table: Vec<String>,
    index: HashMap<String, StringId>,
}

impl Strings {
    /// Interns `s`, returning the existing handle if it was seen before.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(id) = self.index.get(s) {
            return *id;
        }
        self.table.push(s.to_string());
        let id = StringId(self.table.len() as u32);
        self.index.insert(s.to_string(), id);
        id
    }

    /// Resolves a handle, `None` for the anonymous handle.
    pub fn resolve(&self, id: StringId) -> Option<&str> {
        if id.0 == 0 {
            return None;
        }
        self.table.get(id.0 as usize - 1).map(String::as_str)
    }
}

/// A base (scalar) type.
#[derive(Clone, Debug, Default)]
pub struct BaseType {
    /// Type name.
    pub name: StringId,
    /// Width in bits.
    pub bit_size: u32,
    /// Signed integer encoding.
    pub is_signed: bool,
    /// Boolean encoding.
    pub is_bool: bool,
    /// Floating point encoding.
    pub is_float: bool,
}

/// A member of a struct or union.
#[derive(Clone, Debug)]
pub struct ClassMember {
    /// Member name, anonymous members carry the zero handle.
    pub name: StringId,
    /// Core ID of the member's type.
    pub type_ref: u32,
    /// Bit offset from the start of the containing composite, in DWARF's
    /// recommended addressing scheme.
    pub bit_offset: u32,
    /// Bit-field width, 0 for plain members.
    pub bitfield_size: u8,
}

/// A struct, union or class type.
#[derive(Clone, Debug)]
pub struct Composite {
    /// Type name, zero handle when anonymous.
    pub name: StringId,
    /// Size of the complete type in bytes.
    pub byte_size: u32,
    /// True for a forward declaration without a layout.
    pub declaration: bool,
    /// Data members in declaration order.
    pub members: Vec<ClassMember>,
}

/// A (possibly multi-dimensional) array type.
#[derive(Clone, Debug)]
pub struct ArrayType {
    /// Core ID of the element type.
    pub element_type: u32,
    /// Element count per dimension, outermost first.
    pub dimensions: Vec<u32>,
}

impl ArrayType {
    /// Total element count across all dimensions.
    pub fn nelems(&self) -> u32 {
        self.dimensions.iter().product()
    }
}

/// One enumerator of an enumeration type.
#[derive(Clone, Debug)]
pub struct Enumerator {
    /// Enumerator name.
    pub name: StringId,
    /// Enumerator value.
    pub value: u32,
}

/// An enumeration type.
#[derive(Clone, Debug)]
pub struct EnumType {
    /// Type name, zero handle when anonymous.
    pub name: StringId,
    /// Size in bytes.
    pub byte_size: u32,
    /// Enumerators in declaration order.
    pub enumerators: Vec<Enumerator>,
}

/// One parameter of a function prototype.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Parameter name, zero handle when unnamed.
    pub name: StringId,
    /// Core ID of the parameter type.
    pub type_ref: u32,
}

/// A function prototype.
#[derive(Clone, Debug, Default)]
pub struct FuncType {
    /// Core ID of the return type, 0 for `void`.
    pub return_type: u32,
    /// Parameters in declaration order.
    pub params: Vec<Parameter>,
    /// Whether the prototype ends in `...`.
    pub variadic: bool,
}

/// One entry of a unit's type table.
///
/// Reference fields hold the core ID of the referenced tag; 0 means `void`.
#[derive(Clone, Debug)]
pub enum Tag {
    /// A scalar type.
    Base(BaseType),
    /// A `const` qualifier.
    Const(u32),
    /// A pointer.
    Pointer(u32),
    /// A `restrict` qualifier.
    Restrict(u32),
    /// A `volatile` qualifier.
    Volatile(u32),
    /// A type alias.
    Typedef {
        /// Alias name.
        name: StringId,
        /// Core ID of the aliased type.
        type_ref: u32,
    },
    /// A struct type.
    Struct(Composite),
    /// A union type.
    Union(Composite),
    /// A class type, encoded as a struct.
    Class(Composite),
    /// An array type.
    Array(ArrayType),
    /// An enumeration type.
    Enum(EnumType),
    /// A function prototype.
    FuncProto(FuncType),
    /// A tag the loader could not translate; carries the raw DWARF tag value.
    Unsupported(u32),
}

impl Tag {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Tag::Base(_) => "base_type",
            Tag::Const(_) => "const_type",
            Tag::Pointer(_) => "pointer_type",
            Tag::Restrict(_) => "restrict_type",
            Tag::Volatile(_) => "volatile_type",
            Tag::Typedef { .. } => "typedef",
            Tag::Struct(_) => "structure_type",
            Tag::Union(_) => "union_type",
            Tag::Class(_) => "class_type",
            Tag::Array(_) => "array_type",
            Tag::Enum(_) => "enumeration_type",
            Tag::FuncProto(_) => "subroutine_type",
            Tag::Unsupported(_) => "unsupported",
        }
    }
}

/// A function declared in a compilation unit.
#[derive(Clone, Debug)]
pub struct Function {
    /// Function name.
    pub name: StringId,
    /// The function's prototype.
    pub proto: FuncType,
    /// True when this is a declaration without a body.
    pub declaration: bool,
    /// True for externally visible functions.
    pub external: bool,
}

/// Scope of a variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VariableScope {
    /// Allocated in global space.
    Global,
    /// Local to a function.
    Local,
    /// Lives in a register.
    Register,
    /// Optimized away.
    Optimized,
}

/// A variable declared in a compilation unit.
#[derive(Clone, Debug)]
pub struct Variable {
    /// Variable name.
    pub name: StringId,
    /// Core ID of the variable's type, 0 for `void`.
    pub type_ref: u32,
    /// Virtual address of the variable.
    pub address: u64,
    /// Scope of the variable.
    pub scope: VariableScope,
    /// True when this is a declaration.
    pub declaration: bool,
    /// True for externally visible variables.
    pub external: bool,
    /// Link from a declaration to its defining variable, when the producer
    /// split the two.
    pub spec: Option<Box<Variable>>,
}

/// One compilation unit, as handed over by the DWARF loader.
pub struct Cu<'data> {
    /// Name of the object file this unit was compiled into.
    pub filename: String,
    /// Name of the unit itself, usually the source file.
    pub name: String,
    /// The object file the unit belongs to.
    pub elf: &'data ElfObject<'data>,
    types: Vec<Tag>,
    functions: Vec<Function>,
    variables: Vec<Variable>,
    strings: Strings,
}

impl<'data> Cu<'data> {
    /// Creates an empty unit for `filename`.
    pub fn new(
        filename: impl Into<String>,
        name: impl Into<String>,
        elf: &'data ElfObject<'data>,
    ) -> Self {
        Self {
            filename: filename.into(),
            name: name.into(),
            elf,
            types: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
            strings: Strings::default(),
        }
    }

    /// Interns a string into the unit's private table.
    pub fn intern(&mut self, s: &str) -> StringId {
        self.strings.intern(s)
    }

    /// Resolves an interned string.
    pub fn string(&self, id: StringId) -> Option<&str> {
        self.strings.resolve(id)
    }

    /// Appends a tag to the type table and returns its core ID.
    pub fn add_type(&mut self, tag: Tag) -> u32 {
        self.types.push(tag);
        self.types.len() as u32
    }

    /// Appends a function.
    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    /// Appends a variable.
    pub fn add_variable(&mut self, variable: Variable) {
        self.variables.push(variable);
    }

    /// Iterates the type table in core-ID order.
    pub fn types(&self) -> impl Iterator<Item = (u32, &Tag)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, tag)| (i as u32 + 1, tag))
    }

    /// Iterates the functions of the unit.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    /// Iterates the variables of the unit.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    /// Number of entries in the type table.
    pub fn num_types(&self) -> u32 {
        self.types.len() as u32
    }

    /// Finds a base type by name, returning its core ID.
    pub fn find_base_type_by_name(&self, name: &str) -> Option<u32> {
        self.types().find_map(|(core_id, tag)| match tag {
            Tag::Base(bt) if self.string(bt.name) == Some(name) => Some(core_id),
            _ => None,
        })
    }
}
