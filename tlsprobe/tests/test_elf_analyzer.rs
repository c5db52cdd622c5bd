use std::fs::File;
use std::io::Write;

use gimli::write::{AttributeValue, DwarfUnit, EndianVec, Sections};
use object::elf;
use object::write::elf::{FileHeader, ProgramHeader, SectionHeader, Sym, Writer};
use object::Endianness;
use tempfile::NamedTempFile;
use tlsprobe::analysis::{lookup, AnalysisResult, BinaryAnalyzer, ElfAnalyzer, GoAbi, GoVersion};
use tlsprobe::domain::{AnalysisError, BinaryId};
use tlsprobe::offsets::offsets_data;

// ── Synthetic Go executable ─────────────────────────────────────────────

const BASE_ADDRESS: u64 = 0x40_0000;
const BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";

struct FixtureFunction {
    name: &'static str,
    /// Offset from the start of `.text`
    offset: u64,
    code: &'static [u8],
}

/// `Read`: `mov rax, rbx; ret; nop; ret`, `Write`: `nop; nop; ret`,
/// `Close`: `ret`
const GO_FUNCTIONS: [FixtureFunction; 3] = [
    FixtureFunction { name: lookup::READ_FUNC, offset: 0x00, code: &[0x48, 0x89, 0xd8, 0xc3, 0x90, 0xc3] },
    FixtureFunction { name: lookup::WRITE_FUNC, offset: 0x10, code: &[0x90, 0x90, 0xc3] },
    FixtureFunction { name: lookup::CLOSE_FUNC, offset: 0x20, code: &[0xc3] },
];

type Layout = [(&'static str, &'static [(&'static str, u64)])];

/// Struct layouts of go1.21 on amd64, plus an unrelated struct with a
/// `conn` member of its own
const GO_LAYOUT: &Layout = &[
    ("net/http.persistConn", &[("alt", 0), ("conn", 24)]),
    ("crypto/tls.Conn", &[("conn", 0), ("isClient", 16)]),
    ("net.TCPConn", &[("conn", 0)]),
    ("net.conn", &[("fd", 0)]),
    ("net.netFD", &[("pfd", 0), ("family", 72)]),
    ("internal/poll.FD", &[("fdmu", 0), ("Sysfd", 16)]),
];

fn buildinfo(version: &str) -> Vec<u8> {
    let mut data = BUILDINFO_MAGIC.to_vec();
    data.push(8); // pointer size
    data.push(0x2); // inline version strings
    data.resize(32, 0);
    data.push(u8::try_from(version.len()).unwrap());
    data.extend_from_slice(version.as_bytes());
    data
}

fn text_bytes(functions: &[FixtureFunction]) -> Vec<u8> {
    let len = functions.iter().map(|f| f.offset as usize + f.code.len()).max().unwrap_or(0);
    // int3 between functions
    let mut text = vec![0xcc; len];
    for function in functions {
        let start = function.offset as usize;
        text[start..start + function.code.len()].copy_from_slice(function.code);
    }
    text
}

/// `.debug_*` sections describing `layout`
fn dwarf_sections(layout: &Layout) -> Vec<(&'static str, Vec<u8>)> {
    let encoding = gimli::Encoding { format: gimli::Format::Dwarf32, version: 4, address_size: 8 };
    let mut dwarf = DwarfUnit::new(encoding);
    let root = dwarf.unit.root();
    for (struct_name, members) in layout {
        let id = dwarf.unit.add(root, gimli::DW_TAG_structure_type);
        dwarf.unit.get_mut(id).set(gimli::DW_AT_name, AttributeValue::String(struct_name.as_bytes().to_vec()));
        for (member, offset) in *members {
            let member_id = dwarf.unit.add(id, gimli::DW_TAG_member);
            let entry = dwarf.unit.get_mut(member_id);
            entry.set(gimli::DW_AT_name, AttributeValue::String(member.as_bytes().to_vec()));
            entry.set(gimli::DW_AT_data_member_location, AttributeValue::Udata(*offset));
        }
    }

    let mut sections = Sections::new(EndianVec::new(gimli::LittleEndian));
    dwarf.write(&mut sections).unwrap();
    let mut out = Vec::new();
    sections
        .for_each(|id, data| {
            if !data.slice().is_empty() {
                out.push((id.name(), data.slice().to_vec()));
            }
            Ok::<(), gimli::write::Error>(())
        })
        .unwrap();
    out
}

/// Non-stripped x86-64 executable with one `PT_LOAD` segment mapping the
/// headers and `.text` at [`BASE_ADDRESS`]
///
/// Returns the image and the file offset of `.text`.
fn go_binary(functions: &[FixtureFunction], layout: &Layout) -> (Vec<u8>, u64) {
    let text = text_bytes(functions);
    let buildinfo = buildinfo("go1.21.5");
    let debug = dwarf_sections(layout);

    let mut buffer = Vec::new();
    let mut writer = Writer::new(Endianness::Little, true, &mut buffer);

    let text_name = writer.add_section_name(b".text");
    let text_index = writer.reserve_section_index();
    let buildinfo_name = writer.add_section_name(b".go.buildinfo");
    writer.reserve_section_index();
    let debug_names: Vec<_> = debug
        .iter()
        .map(|&(name, _)| {
            let id = writer.add_section_name(name.as_bytes());
            writer.reserve_section_index();
            id
        })
        .collect();
    writer.reserve_symtab_section_index();
    writer.reserve_strtab_section_index();
    writer.reserve_shstrtab_section_index();

    let symbol_names: Vec<_> = functions
        .iter()
        .map(|function| {
            let name: &'static str = function.name;
            writer.add_string(name.as_bytes())
        })
        .collect();
    for _ in functions {
        writer.reserve_symbol_index(Some(text_index));
    }

    writer.reserve_file_header();
    writer.reserve_program_headers(1);
    let text_offset = writer.reserve(text.len(), 16);
    let buildinfo_offset = writer.reserve(buildinfo.len(), 16);
    let debug_offsets: Vec<usize> = debug.iter().map(|(_, data)| writer.reserve(data.len(), 1)).collect();
    writer.reserve_symtab();
    writer.reserve_strtab();
    writer.reserve_shstrtab();
    writer.reserve_section_headers();

    let text_address = BASE_ADDRESS + text_offset as u64;
    let loaded = (text_offset + text.len()) as u64;
    writer
        .write_file_header(&FileHeader {
            os_abi: elf::ELFOSABI_NONE,
            abi_version: 0,
            e_type: elf::ET_EXEC,
            e_machine: elf::EM_X86_64,
            e_entry: text_address,
            e_flags: 0,
        })
        .unwrap();
    writer.write_align_program_headers();
    writer.write_program_header(&ProgramHeader {
        p_type: elf::PT_LOAD,
        p_flags: elf::PF_R | elf::PF_X,
        p_offset: 0,
        p_vaddr: BASE_ADDRESS,
        p_paddr: BASE_ADDRESS,
        p_filesz: loaded,
        p_memsz: loaded,
        p_align: 0x1000,
    });

    writer.write_align(16);
    writer.write(&text);
    writer.write_align(16);
    writer.write(&buildinfo);
    for (_, data) in &debug {
        writer.write(data);
    }

    writer.write_null_symbol();
    for (function, name) in functions.iter().zip(&symbol_names) {
        writer.write_symbol(&Sym {
            name: Some(*name),
            section: Some(text_index),
            st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
            st_other: elf::STV_DEFAULT,
            st_shndx: 0,
            st_value: text_address + function.offset,
            st_size: function.code.len() as u64,
        });
    }
    writer.write_strtab();
    writer.write_shstrtab();

    writer.write_null_section_header();
    writer.write_section_header(&SectionHeader {
        name: Some(text_name),
        sh_type: elf::SHT_PROGBITS,
        sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
        sh_addr: text_address,
        sh_offset: text_offset as u64,
        sh_size: text.len() as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 16,
        sh_entsize: 0,
    });
    writer.write_section_header(&SectionHeader {
        name: Some(buildinfo_name),
        sh_type: elf::SHT_PROGBITS,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: buildinfo_offset as u64,
        sh_size: buildinfo.len() as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 16,
        sh_entsize: 0,
    });
    for ((name, offset), (_, data)) in debug_names.iter().zip(&debug_offsets).zip(&debug) {
        writer.write_section_header(&SectionHeader {
            name: Some(*name),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: *offset as u64,
            sh_size: data.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        });
    }
    writer.write_symtab_section_header(1);
    writer.write_strtab_section_header();
    writer.write_shstrtab_section_header();

    (buffer, text_offset as u64)
}

fn analyze(image: &[u8]) -> Result<AnalysisResult, AnalysisError> {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(image).unwrap();
    // Fresh handle, the analyzer reads from the current position
    let file = File::open(tmp.path()).unwrap();
    ElfAnalyzer::new().inspect(&file, &lookup::FUNCTIONS, &lookup::STRUCT_FIELDS)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[test]
fn test_synthetic_go_binary_analysis() {
    let (image, text) = go_binary(&GO_FUNCTIONS, GO_LAYOUT);
    let result = analyze(&image).expect("Failed to analyze synthetic Go binary");

    assert_eq!(result.go_version, GoVersion { major: 1, minor: 21, patch: 5 });
    assert_eq!(result.abi, GoAbi::Register);

    // The segment maps file offset 0, so file offsets are relative to .text
    let read = result.function(lookup::READ_FUNC).unwrap();
    assert_eq!(read.entry, text);
    assert_eq!(read.returns, vec![text + 3, text + 5]);

    let write = result.function(lookup::WRITE_FUNC).unwrap();
    assert_eq!(write.entry, text + 0x10);
    assert_eq!(write.returns, vec![text + 0x12]);

    let close = result.function(lookup::CLOSE_FUNC).unwrap();
    assert_eq!(close.entry, text + 0x20);
    assert!(close.returns.is_empty());

    assert_eq!(result.field_offset(&lookup::TLS_CONN_INNER_CONN), Some(0));
    assert_eq!(result.field_offset(&lookup::TCP_CONN_INNER_CONN), Some(0));
    assert_eq!(result.field_offset(&lookup::CONN_FD), Some(0));
    assert_eq!(result.field_offset(&lookup::NET_FD_PFD), Some(0));
    assert_eq!(result.field_offset(&lookup::FD_SYSFD), Some(16));

    let data = offsets_data(BinaryId::new(0, 0), &result).expect("incomplete struct offsets");
    assert_eq!(data.conn_layout.fd_sysfd_offset, 16);
    assert_eq!(data.go_version_minor, 21);
}

#[test]
fn test_missing_function_not_instrumentable() {
    let (image, _) = go_binary(&GO_FUNCTIONS[..2], GO_LAYOUT);
    let err = analyze(&image).unwrap_err();
    assert!(err.is_not_instrumentable(), "unexpected error: {err}");
    assert!(err.to_string().contains(lookup::CLOSE_FUNC));
}

#[test]
fn test_missing_struct_field_not_instrumentable() {
    let (image, _) = go_binary(&GO_FUNCTIONS, &GO_LAYOUT[..GO_LAYOUT.len() - 1]);
    let err = analyze(&image).unwrap_err();
    assert!(err.is_not_instrumentable(), "unexpected error: {err}");
    assert!(err.to_string().contains("internal/poll.FD.Sysfd"));
}

#[test]
fn test_own_binary_is_not_instrumentable() {
    let binary_path = env!("CARGO_BIN_EXE_tlsprobe");
    println!("Inspecting: {binary_path}");

    let file = File::open(binary_path).expect("Failed to open tlsprobe binary");
    let err = ElfAnalyzer::new()
        .inspect(&file, &lookup::FUNCTIONS, &lookup::STRUCT_FIELDS)
        .expect_err("a Rust binary must not look like Go");
    assert!(err.is_not_instrumentable(), "unexpected error: {err}");
}

/// Set `TLSPROBE_TEST_GO_BINARY` to a non-stripped Go binary that uses
/// `crypto/tls` (e.g. built with `go build` from a program calling `tls.Dial`)
#[test]
fn test_go_binary_analysis() {
    let Some(binary_path) = std::env::var_os("TLSPROBE_TEST_GO_BINARY") else {
        println!("TLSPROBE_TEST_GO_BINARY not set, skipping");
        return;
    };

    let file = File::open(&binary_path).expect("Failed to open Go binary");
    let result = ElfAnalyzer::new()
        .inspect(&file, &lookup::FUNCTIONS, &lookup::STRUCT_FIELDS)
        .expect("Failed to analyze Go binary");

    println!("Go version: {} ({:?} ABI)", result.go_version, result.abi);
    assert!(result.go_version.minor >= 18);
    assert_eq!(result.abi, GoAbi::Register);

    for spec in &lookup::FUNCTIONS {
        let location = result.function(spec.name).expect("function missing from result");
        println!("{}: entry 0x{:x}, {} returns", spec.name, location.entry, location.returns.len());
        assert!(location.entry > 0);
        assert_eq!(spec.include_returns, !location.returns.is_empty());
        assert!(location.returns.iter().all(|&ret| ret > location.entry));
    }

    // Every field needed by the hooks must be present
    let data = offsets_data(BinaryId::new(0, 0), &result).expect("incomplete struct offsets");
    println!("layout: {:?}", data.conn_layout);
}
