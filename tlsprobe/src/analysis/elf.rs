//! ELF implementation of [`BinaryAnalyzer`] for Go executables
//!
//! All offsets reported are **file offsets**: uprobes are attached at
//! `(path, offset)`, not at virtual addresses.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::rc::Rc;

use capstone::prelude::*;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use object::{Architecture, Object, ObjectSection, ObjectSegment, ObjectSymbol};

use super::{AnalysisResult, BinaryAnalyzer, FieldSpec, FunctionLocation, FunctionSpec, GoAbi, GoVersion};
use crate::domain::AnalysisError;

const BUILDINFO_SECTION: &str = ".go.buildinfo";
const BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";
const BUILDINFO_HEADER_LEN: usize = 32;
/// Set in the header flags when version strings are stored inline (Go 1.18+)
const BUILDINFO_FLAG_INLINE: u8 = 0x2;

/// Analyzer backed by `object`, `gimli` and `capstone`
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfAnalyzer;

impl ElfAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Analyze an in-memory image
    ///
    /// # Errors
    /// See [`BinaryAnalyzer::inspect`].
    pub fn inspect_bytes(
        &self,
        data: &[u8],
        functions: &[FunctionSpec],
        fields: &[FieldSpec],
    ) -> Result<AnalysisResult, AnalysisError> {
        let obj = match object::File::parse(data) {
            Ok(obj) => obj,
            Err(e) if data.starts_with(b"\x7fELF") => {
                return Err(AnalysisError::MalformedImage(e.to_string()));
            }
            Err(_) => return Err(not_instrumentable("not an ELF file")),
        };

        let arch = obj.architecture();
        if !matches!(arch, Architecture::X86_64 | Architecture::Aarch64) {
            return Err(not_instrumentable(format!("unsupported architecture {arch:?}")));
        }

        let go_version = read_go_version(&obj)?;
        let abi = go_abi(arch, go_version);
        debug!("found {go_version} binary ({arch:?}, {abi:?} ABI)");

        let functions = locate_functions(&obj, arch, functions)?;
        let struct_offsets = read_struct_offsets(&obj, fields)?;

        Ok(AnalysisResult { functions, struct_offsets, go_version, abi })
    }
}

impl BinaryAnalyzer for ElfAnalyzer {
    fn inspect(
        &self,
        image: &File,
        functions: &[FunctionSpec],
        fields: &[FieldSpec],
    ) -> Result<AnalysisResult, AnalysisError> {
        let mut data = Vec::new();
        let mut reader = image;
        reader.read_to_end(&mut data)?;
        self.inspect_bytes(&data, functions, fields)
    }
}

fn not_instrumentable(reason: impl Into<String>) -> AnalysisError {
    AnalysisError::NotInstrumentable(reason.into())
}

fn malformed(err: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::MalformedImage(err.to_string())
}

// ============================================================================
// Go build info
// ============================================================================

fn read_go_version(obj: &object::File<'_>) -> Result<GoVersion, AnalysisError> {
    let section =
        obj.section_by_name(BUILDINFO_SECTION).ok_or_else(|| not_instrumentable("not a Go binary"))?;
    let data = section.data().map_err(malformed)?;
    let version = parse_buildinfo_version(data)?;
    GoVersion::parse(&version)
        .ok_or_else(|| not_instrumentable(format!("unrecognized Go version {version:?}")))
}

/// Extract the toolchain version string from a `.go.buildinfo` blob
fn parse_buildinfo_version(data: &[u8]) -> Result<String, AnalysisError> {
    if data.len() < BUILDINFO_HEADER_LEN || !data.starts_with(BUILDINFO_MAGIC) {
        return Err(malformed("invalid .go.buildinfo header"));
    }
    let flags = data[BUILDINFO_MAGIC.len() + 1];
    if flags & BUILDINFO_FLAG_INLINE == 0 {
        // Pointer-based layout of Go 1.17 and older
        return Err(not_instrumentable("unsupported Go version (built before go1.18)"));
    }

    let rest = &data[BUILDINFO_HEADER_LEN..];
    let (len, used) = read_uvarint(rest).ok_or_else(|| malformed("truncated Go version"))?;
    let len = usize::try_from(len).map_err(malformed)?;
    let bytes = rest
        .get(used..used.saturating_add(len))
        .ok_or_else(|| malformed("truncated Go version"))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Decode an unsigned LEB128 varint, returning the value and bytes consumed
fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Register ABI arrived on amd64 with go1.17 and on arm64 with go1.18
fn go_abi(arch: Architecture, version: GoVersion) -> GoAbi {
    let min_minor = match arch {
        Architecture::X86_64 => 17,
        Architecture::Aarch64 => 18,
        _ => return GoAbi::Stack,
    };
    if version.major > 1 || (version.major == 1 && version.minor >= min_minor) {
        GoAbi::Register
    } else {
        GoAbi::Stack
    }
}

// ============================================================================
// Function locations
// ============================================================================

fn locate_functions(
    obj: &object::File<'_>,
    machine: Architecture,
    specs: &[FunctionSpec],
) -> Result<HashMap<String, FunctionLocation>, AnalysisError> {
    let mut symbols: HashMap<&str, (u64, u64)> = HashMap::new();
    for symbol in obj.symbols() {
        if let Ok(name) = symbol.name() {
            if specs.iter().any(|spec| spec.name == name) {
                symbols.insert(name, (symbol.address(), symbol.size()));
            }
        }
    }
    if symbols.is_empty() && obj.symbols().next().is_none() {
        return Err(not_instrumentable("binary is stripped"));
    }

    let segments: Vec<(u64, u64, u64)> = obj
        .segments()
        .map(|seg| {
            let (offset, file_size) = seg.file_range();
            (seg.address(), offset, file_size)
        })
        .collect();

    let mut locations = HashMap::with_capacity(specs.len());
    for spec in specs {
        let &(address, size) = symbols
            .get(spec.name)
            .ok_or_else(|| not_instrumentable(format!("function {} not found", spec.name)))?;

        let entry = vaddr_to_file_offset(&segments, address).ok_or_else(|| {
            malformed(format!("{} at 0x{address:x} is not in a loadable segment", spec.name))
        })?;

        let returns = if spec.include_returns {
            let code = function_bytes(obj, address, size)
                .ok_or_else(|| malformed(format!("no code for {}", spec.name)))?;
            return_sites(machine, code, address)?
                .into_iter()
                .map(|addr| {
                    vaddr_to_file_offset(&segments, addr)
                        .ok_or_else(|| malformed(format!("return of {} outside segments", spec.name)))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        locations.insert(spec.name.to_string(), FunctionLocation { entry, returns });
    }

    Ok(locations)
}

/// Translate a virtual address through the segment that maps it from the file
fn vaddr_to_file_offset(segments: &[(u64, u64, u64)], addr: u64) -> Option<u64> {
    segments.iter().find_map(|&(seg_addr, file_offset, file_size)| {
        (addr >= seg_addr && addr - seg_addr < file_size).then(|| file_offset + (addr - seg_addr))
    })
}

fn function_bytes<'data>(obj: &object::File<'data>, address: u64, size: u64) -> Option<&'data [u8]> {
    obj.sections().find_map(|section| section.data_range(address, size).ok().flatten())
}

/// Virtual addresses of every `ret` instruction in `code`
fn return_sites(machine: Architecture, code: &[u8], address: u64) -> Result<Vec<u64>, AnalysisError> {
    let cs = match machine {
        Architecture::X86_64 => Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).build(),
        _ => Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).build(),
    }
    .map_err(|e| malformed(format!("disassembler init failed: {e}")))?;

    let insns = cs.disasm_all(code, address).map_err(malformed)?;
    let sites: Vec<u64> =
        insns.iter().filter(|insn| insn.mnemonic() == Some("ret")).map(|insn| insn.address()).collect();

    if sites.is_empty() {
        return Err(not_instrumentable(format!("no return instruction found at 0x{address:x}")));
    }
    Ok(sites)
}

// ============================================================================
// Struct layouts (DWARF)
// ============================================================================

type DwarfReader = EndianRcSlice<RunTimeEndian>;

fn read_struct_offsets(
    obj: &object::File<'_>,
    fields: &[FieldSpec],
) -> Result<HashMap<FieldSpec, u64>, AnalysisError> {
    if fields.is_empty() {
        return Ok(HashMap::new());
    }

    let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
    let load_section = |id: gimli::SectionId| -> Result<DwarfReader, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };
    let dwarf = gimli::Dwarf::load(&load_section).map_err(malformed)?;

    let mut wanted: HashMap<&str, Vec<FieldSpec>> = HashMap::new();
    for field in fields {
        wanted.entry(field.struct_name).or_default().push(*field);
    }

    let mut offsets = HashMap::with_capacity(fields.len());
    let mut saw_unit = false;
    let mut units = dwarf.units();
    while let Some(header) = units.next().map_err(malformed)? {
        saw_unit = true;
        let unit = dwarf.unit(header).map_err(malformed)?;
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs().map_err(malformed)? {
            if entry.tag() != gimli::DW_TAG_structure_type {
                continue;
            }
            let Some(name) = die_name(&dwarf, &unit, entry) else {
                continue;
            };
            let Some(specs) = wanted.get(name.as_str()) else {
                continue;
            };
            collect_members(&dwarf, &unit, entry.offset(), specs, &mut offsets)?;
        }
        if offsets.len() == fields.len() {
            break;
        }
    }

    if !saw_unit {
        return Err(not_instrumentable("no DWARF debug info"));
    }
    if let Some(missing) = fields.iter().find(|f| !offsets.contains_key(*f)) {
        return Err(not_instrumentable(format!("field {missing} not found in DWARF")));
    }
    Ok(offsets)
}

fn collect_members(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    struct_offset: gimli::UnitOffset,
    specs: &[FieldSpec],
    out: &mut HashMap<FieldSpec, u64>,
) -> Result<(), AnalysisError> {
    let mut tree = unit.entries_tree(Some(struct_offset)).map_err(malformed)?;
    let root = tree.root().map_err(malformed)?;
    let mut children = root.children();
    while let Some(child) = children.next().map_err(malformed)? {
        let member = child.entry();
        if member.tag() != gimli::DW_TAG_member {
            continue;
        }
        let Some(name) = die_name(dwarf, unit, member) else {
            continue;
        };
        let Some(spec) = specs.iter().find(|spec| spec.field_name == name) else {
            continue;
        };
        let location = member
            .attr_value(gimli::DW_AT_data_member_location)
            .map_err(malformed)?
            .and_then(|value| value.udata_value());
        if let Some(offset) = location {
            out.insert(*spec, offset);
        }
    }
    Ok(())
}

fn die_name(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfReader>,
) -> Option<String> {
    let value = entry.attr_value(gimli::DW_AT_name).ok()??;
    let name = dwarf.attr_string(unit, value).ok()?;
    gimli::Reader::to_string_lossy(&name).ok().map(Cow::into_owned)
}
