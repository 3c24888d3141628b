//! The DWARF-to-BTF translation engine.
//!
//! [`BtfEncoder`] is driven with one [`Cu`] at a time. The first unit of an
//! object opens a [`BtfWriter`] and scans the object's symbol table; every
//! unit then has its type table encoded in core-ID order, followed by the
//! eligible functions and per-CPU variables. A unit with a different
//! filename finalizes the active object and starts the next one.
//!
//! Type IDs are the load-bearing part: the BTF ID of every encoded tag must
//! equal its core ID plus the `type_id_off` snapshot taken when the unit
//! began. The encoder verifies this for each tag and aborts the session on
//! any drift.

mod symbols;

use core::mem;

use log::{debug, warn};

use crate::{
    btf::{Btf, BtfError, BtfKind, BtfWriter, PERCPU_SECTION, VarLinkage},
    cu::{BaseType, Composite, Cu, EnumType, FuncType, Tag, VariableScope},
    elf::ElfError,
    encoder::symbols::{ElfFunction, VarInfo},
};

/// Maximum length of a BTF identifier, including the terminating null.
///
/// This corresponds to the same limit in `include/linux/kallsyms.h`.
const KSYM_NAME_LEN: usize = 128;

/// The error type returned when encoding fails.
///
/// Any of these aborts the active session: the in-progress table is dropped
/// and no partial blob is committed.
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    /// The BTF writer rejected an operation.
    #[error(transparent)]
    Btf(#[from] BtfError),

    /// Object file access failed.
    #[error(transparent)]
    Elf(#[from] ElfError),

    /// The ID returned by the writer diverged from the expected
    /// `core_id + type_id_off`, a contract violation between loader and
    /// encoder.
    #[error("{kind} id drift, core_id: {core_id}, btf_type_id: {btf_type_id}, type_id_off: {type_id_off}")]
    IdDrift {
        /// tag kind name
        kind: &'static str,
        /// core ID of the tag
        core_id: u32,
        /// ID the writer returned
        btf_type_id: u32,
        /// snapshot the unit started with
        type_id_off: u32,
    },

    /// The unit contains a tag kind with no BTF representation.
    #[error("unsupported tag 0x{tag:x}")]
    UnsupportedTag {
        /// raw DWARF tag value
        tag: u32,
    },

    /// A per-CPU symbol name is not a valid BTF identifier.
    #[error("found symbol of invalid name when encoding BTF (sym: '{name}')")]
    InvalidSymbolName {
        /// offending symbol name
        name: String,
    },

    /// The per-CPU variable table is full.
    #[error("reached the limit of per-CPU variables: {limit}")]
    PercpuTableFull {
        /// table capacity
        limit: usize,
    },

    /// The mcount address range does not lie within its section.
    #[error("mcount address table lies outside section({section})")]
    InvalidMcountTable {
        /// section index the anchors point into
        section: usize,
    },

    /// A per-CPU variable resolved to the `void` type.
    #[error("found variable '{name}' in unit '{unit}' that has void type")]
    VoidTypedVariable {
        /// variable name
        name: String,
        /// unit the variable came from
        unit: String,
    },
}

/// Flags modulating one encoding run.
#[derive(Clone, Debug, Default)]
pub struct EncodeOptions {
    /// Log per-symbol and per-variable progress.
    pub verbose: bool,
    /// Downgrade invalid identifiers and void-typed per-CPU variables from
    /// fatal errors to skipped-with-warning.
    pub force: bool,
    /// Do not encode per-CPU variables at all.
    pub skip_encoding_vars: bool,
}

/// One finished BTF blob.
#[derive(Clone, Debug)]
pub struct EncodedObject {
    /// Name of the object file the blob describes.
    pub filename: String,
    /// The serialized BTF.
    pub bytes: Vec<u8>,
}

/// The encoding session.
///
/// Owns the active writer and the symbol tables scanned from the current
/// object. The loader drives it sequentially; state is reset at object
/// boundaries and on every fatal error.
pub struct BtfEncoder<'data> {
    writer: Option<BtfWriter>,
    functions: Vec<ElfFunction<'data>>,
    percpu_vars: Vec<VarInfo<'data>>,
    array_index_id: u32,
    has_index_type: bool,
    need_index_type: bool,
    base_btf: Option<Btf>,
    outputs: Vec<EncodedObject>,
}

impl<'data> BtfEncoder<'data> {
    /// Creates an idle session.
    pub fn new() -> Self {
        Self {
            writer: None,
            functions: Vec::new(),
            percpu_vars: Vec::new(),
            array_index_id: 0,
            has_index_type: false,
            need_index_type: false,
            base_btf: None,
            outputs: Vec::new(),
        }
    }

    /// Creates a session whose writers continue the IDs of an
    /// already-encoded base table.
    pub fn with_base_btf(base_btf: Btf) -> Self {
        Self {
            base_btf: Some(base_btf),
            ..Self::new()
        }
    }

    /// Encodes one compilation unit.
    ///
    /// On error the active session is torn down; a subsequent call starts
    /// fresh.
    pub fn encode_cu(&mut self, cu: &Cu<'data>, opts: &EncodeOptions) -> Result<(), EncodeError> {
        match self.try_encode_cu(cu, opts) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    /// Commits the last object and returns every blob produced.
    pub fn finish(mut self) -> Result<Vec<EncodedObject>, EncodeError> {
        self.encode_object()?;
        Ok(mem::take(&mut self.outputs))
    }

    fn try_encode_cu(&mut self, cu: &Cu<'data>, opts: &EncodeOptions) -> Result<(), EncodeError> {
        if self
            .writer
            .as_ref()
            .is_some_and(|writer| writer.filename() != cu.filename)
        {
            self.encode_object()?;
        }

        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let writer = BtfWriter::new(&cu.filename, cu.elf, self.base_btf.clone());
                let percpu_shndx = writer.percpu_section().map(|section| section.index);
                let tables = symbols::collect_symbols(
                    cu.elf,
                    percpu_shndx,
                    !opts.skip_encoding_vars,
                    opts.verbose,
                    opts.force,
                )?;
                self.functions = tables.functions;
                self.percpu_vars = tables.percpu_vars;

                self.has_index_type = false;
                self.need_index_type = false;
                self.array_index_id = 0;

                if opts.verbose {
                    debug!("file {}:", writer.filename());
                }
                writer
            }
        };

        let result = self.encode_cu_with(&mut writer, cu, opts);
        self.writer = Some(writer);
        result
    }

    fn encode_cu_with(
        &mut self,
        writer: &mut BtfWriter,
        cu: &Cu<'data>,
        opts: &EncodeOptions,
    ) -> Result<(), EncodeError> {
        let type_id_off = writer.type_count();

        if !self.has_index_type {
            if let Some(core_id) = cu.find_base_type_by_name("int") {
                self.has_index_type = true;
                self.array_index_id = type_id_off + core_id;
            } else {
                // Reserve the slot right past the unit's last type for a
                // synthetic index type. An `int` appearing later in this
                // unit is deliberately ignored, the reservation must not
                // move once arrays started referencing it.
                self.array_index_id = type_id_off + cu.num_types() + 1;
            }
        }

        for (core_id, tag) in cu.types() {
            let btf_type_id = encode_tag(
                writer,
                cu,
                tag,
                self.array_index_id,
                type_id_off,
                &mut self.need_index_type,
            )?;
            check_id_drift(tag, core_id, btf_type_id, type_id_off)?;
        }

        if self.need_index_type && !self.has_index_type {
            let bt = BaseType {
                bit_size: 32,
                ..Default::default()
            };
            writer.add_base_type(&bt, "__ARRAY_SIZE_TYPE__")?;
            self.has_index_type = true;
        }

        for function in cu.functions() {
            // A non-empty function table means the kernel layout was
            // detected and ftrace locations select the functions. Otherwise
            // keep the debug-info declaration check.
            if !self.functions.is_empty() {
                if !has_arg_names(cu, &function.proto) {
                    continue;
                }
                let Some(name) = cu.string(function.name) else {
                    continue;
                };
                if !should_generate_function(&mut self.functions, name) {
                    continue;
                }
            } else if function.declaration || !function.external {
                continue;
            }

            let proto_id = writer.add_func_proto(cu, &function.proto, type_id_off);
            writer.add_ref_type(BtfKind::Func, proto_id, cu.string(function.name), false)?;
        }

        if opts.skip_encoding_vars || !writer.has_symtab() {
            return Ok(());
        }
        let Some(percpu) = writer.percpu_section() else {
            return Ok(());
        };

        if opts.verbose {
            debug!("searching unit '{}' for per-CPU global variables", cu.name);
        }

        for var in cu.variables() {
            if var.declaration && var.spec.is_none() {
                continue;
            }
            // per-CPU variables are allocated in global space
            if var.scope != VariableScope::Global && var.spec.is_none() {
                continue;
            }

            // the address belongs to this tag even when the declaration
            // defers to a specification
            let addr = var.address;
            let var = var.spec.as_deref().unwrap_or(var);

            let Some((size, name)) = percpu_var_lookup(&self.percpu_vars, addr) else {
                continue;
            };

            if var.type_ref == 0 {
                if opts.force {
                    warn!(
                        "ignoring variable '{}' in unit '{}' that has void type",
                        name, cu.name
                    );
                    continue;
                }
                return Err(EncodeError::VoidTypedVariable {
                    name: name.to_string(),
                    unit: cu.name.clone(),
                });
            }

            let type_id = type_id_off + var.type_ref;
            let linkage = if var.external {
                VarLinkage::GlobalAllocated
            } else {
                VarLinkage::Static
            };

            if opts.verbose {
                debug!(
                    "variable '{}' from unit '{}' at address {:#x} encoded",
                    name, cu.name, addr
                );
            }

            let var_id = writer.add_var_type(type_id, name, linkage);
            let offset = (addr - percpu.address) as u32;
            writer.add_var_secinfo(var_id, offset, size);
        }

        Ok(())
    }

    /// Finalizes the active object: emits the per-CPU DATASEC when any
    /// section infos accumulated, serializes the table and releases the
    /// symbol tables.
    fn encode_object(&mut self) -> Result<(), EncodeError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        if writer.percpu_secinfo_len() != 0 {
            writer.add_datasec_type(PERCPU_SECTION)?;
        }

        let bytes = writer.encode();
        self.outputs.push(EncodedObject {
            filename: writer.filename().to_string(),
            bytes,
        });

        self.functions.clear();
        self.percpu_vars.clear();
        Ok(())
    }

    fn teardown(&mut self) {
        self.writer = None;
        self.functions.clear();
        self.percpu_vars.clear();
    }
}

impl Default for BtfEncoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_id_drift(
    tag: &Tag,
    core_id: u32,
    btf_type_id: u32,
    type_id_off: u32,
) -> Result<(), EncodeError> {
    if btf_type_id != core_id + type_id_off {
        return Err(EncodeError::IdDrift {
            kind: tag.kind_name(),
            core_id,
            btf_type_id,
            type_id_off,
        });
    }
    Ok(())
}

fn encode_composite(
    writer: &mut BtfWriter,
    cu: &Cu<'_>,
    kind: BtfKind,
    composite: &Composite,
    type_id_off: u32,
) -> Result<u32, EncodeError> {
    let type_id = writer.add_struct(kind, cu.string(composite.name), composite.byte_size)?;

    for member in composite.members.iter() {
        // the loader uses DWARF's recommended bit offset addressing scheme,
        // which conforms to the BTF requirement, so no conversion happens
        writer.add_member(
            cu.string(member.name),
            type_id_off + member.type_ref,
            member.bitfield_size,
            member.bit_offset,
        )?;
    }

    Ok(type_id)
}

fn encode_enum(writer: &mut BtfWriter, cu: &Cu<'_>, etype: &EnumType) -> Result<u32, EncodeError> {
    let type_id = writer.add_enum(cu.string(etype.name), etype.byte_size);
    for enumerator in etype.enumerators.iter() {
        writer.add_enum_val(cu.string(enumerator.name), enumerator.value)?;
    }
    Ok(type_id)
}

fn encode_tag(
    writer: &mut BtfWriter,
    cu: &Cu<'_>,
    tag: &Tag,
    array_index_id: u32,
    type_id_off: u32,
    need_index_type: &mut bool,
) -> Result<u32, EncodeError> {
    // single out core ID 0, it represents the special type "void"
    let ref_id = |type_ref: u32| {
        if type_ref == 0 {
            0
        } else {
            type_id_off + type_ref
        }
    };

    match tag {
        Tag::Base(bt) => {
            let name = cu.string(bt.name).unwrap_or_default();
            Ok(writer.add_base_type(bt, name)?)
        }
        Tag::Const(type_ref) => {
            Ok(writer.add_ref_type(BtfKind::Const, ref_id(*type_ref), None, false)?)
        }
        Tag::Pointer(type_ref) => {
            Ok(writer.add_ref_type(BtfKind::Ptr, ref_id(*type_ref), None, false)?)
        }
        Tag::Restrict(type_ref) => {
            Ok(writer.add_ref_type(BtfKind::Restrict, ref_id(*type_ref), None, false)?)
        }
        Tag::Volatile(type_ref) => {
            Ok(writer.add_ref_type(BtfKind::Volatile, ref_id(*type_ref), None, false)?)
        }
        Tag::Typedef { name, type_ref } => {
            Ok(writer.add_ref_type(BtfKind::Typedef, ref_id(*type_ref), cu.string(*name), false)?)
        }
        Tag::Struct(composite) | Tag::Class(composite) => {
            if composite.declaration {
                Ok(writer.add_ref_type(BtfKind::Fwd, 0, cu.string(composite.name), false)?)
            } else {
                encode_composite(writer, cu, BtfKind::Struct, composite, type_id_off)
            }
        }
        Tag::Union(composite) => {
            if composite.declaration {
                Ok(writer.add_ref_type(BtfKind::Fwd, 0, cu.string(composite.name), true)?)
            } else {
                encode_composite(writer, cu, BtfKind::Union, composite, type_id_off)
            }
        }
        Tag::Array(array) => {
            *need_index_type = true;
            Ok(writer.add_array(ref_id(array.element_type), array_index_id, array.nelems()))
        }
        Tag::Enum(etype) => encode_enum(writer, cu, etype),
        Tag::FuncProto(ftype) => Ok(writer.add_func_proto(cu, ftype, type_id_off)),
        Tag::Unsupported(tag) => Err(EncodeError::UnsupportedTag { tag: *tag }),
    }
}

fn has_arg_names(cu: &Cu<'_>, ftype: &FuncType) -> bool {
    ftype
        .params
        .iter()
        .all(|param| cu.string(param.name).is_some())
}

/// Looks the function up by name and claims it. Returns false for unknown
/// functions and for functions already emitted by an earlier unit.
fn should_generate_function(functions: &mut [ElfFunction<'_>], name: &str) -> bool {
    let Ok(index) = functions.binary_search_by(|func| func.name.cmp(name)) else {
        return false;
    };
    let func = &mut functions[index];
    if func.generated {
        return false;
    }
    func.generated = true;
    true
}

fn percpu_var_lookup<'data>(vars: &[VarInfo<'data>], addr: u64) -> Option<(u32, &'data str)> {
    let index = vars.binary_search_by_key(&addr, |var| var.addr).ok()?;
    Some((vars[index].size, vars[index].name))
}

fn name_char_ok(c: char, first: bool) -> bool {
    if c == '_' || c == '.' {
        return true;
    }
    if first {
        c.is_ascii_alphabetic()
    } else {
        c.is_ascii_alphanumeric()
    }
}

/// Checks whether `name` is a valid identifier in vmlinux BTF: it must fit
/// a [`KSYM_NAME_LEN`] byte buffer including the terminating null, start
/// with a letter, underscore or dot, and continue with letters, digits,
/// underscores or dots.
pub(crate) fn name_valid(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !name_char_ok(first, true) {
        return false;
    }
    if name.len() >= KSYM_NAME_LEN {
        return false;
    }
    chars.all(|c| name_char_ok(c, false))
}
