//! A DWARF-to-BTF type encoder.
//!
//! # Overview
//!
//! Kernels and BPF-adjacent tooling describe C types with BTF, a compact
//! binary format the verifier can consume. This crate implements the
//! translation from a debug-information model — compilation units full of
//! type, function and variable tags, the kind a DWARF loader produces — into
//! serialized BTF, one blob per object file.
//!
//! The interesting part is ID accounting: BTF type IDs are dense and
//! 1-based, and the encoder guarantees that every tag's BTF ID equals its
//! core ID within the unit plus the ID offset the unit started at. On
//! kernel images the encoder additionally cross-references the ELF symbol
//! table and the ftrace mcount table to decide which functions deserve FUNC
//! records, and scans the `.data..percpu` section to describe per-CPU
//! variables with VAR/DATASEC records.
//!
//! # Example
//!
//! ```no_run
//! use btf_encoder::{
//!     cu::Cu,
//!     elf::ElfObject,
//!     encoder::{BtfEncoder, EncodeOptions},
//! };
//!
//! let data = std::fs::read("vmlinux").unwrap();
//! let elf = ElfObject::parse(&data).unwrap();
//! let cu = Cu::new("vmlinux", "init/main.c", &elf);
//! // ... the DWARF loader fills the unit with tags ...
//!
//! let mut encoder = BtfEncoder::new();
//! encoder.encode_cu(&cu, &EncodeOptions::default()).unwrap();
//! for object in encoder.finish().unwrap() {
//!     std::fs::write(format!("{}.btf", object.filename), &object.bytes).unwrap();
//! }
//! ```

#![deny(clippy::all, missing_docs)]

pub mod btf;
pub mod cu;
pub mod elf;
pub mod encoder;
#[cfg(test)]
pub(crate) mod test_utils;
mod util;

pub use encoder::{BtfEncoder, EncodeError, EncodeOptions, EncodedObject};
