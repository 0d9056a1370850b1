//! # ELF Image Reader
//!
//! Parses the on-disk executable image of an inspected process:
//! - Fixed header, section table, section names
//! - Static (`.symtab`/`.strtab`) and dynamic (`.dynsym`/`.dynstr`) symbols
//! - Embedded C-strings scanned out of `.rodata`
//! - PLT relocation records (`.rela.plt`)
//! - Function materialisation: symbol -> raw opcode bytes
//!
//! The reader converts goblin's borrowed view into owned, typed tables at
//! construction and keeps the raw file bytes for on-demand range reads, so
//! queries never re-parse and never borrow from the parse buffer.

use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::{header, section_header, sym, Elf};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{InspectError, InspectResult};

pub const TEXT_SECTION: &str = ".text";
pub const INIT_SECTION: &str = ".init";
pub const FINI_SECTION: &str = ".fini";
pub const PLT_SECTION: &str = ".plt";
pub const PLT_SEC_SECTION: &str = ".plt.sec";
pub const RODATA_SECTION: &str = ".rodata";
pub const SYMTAB_SECTION: &str = ".symtab";
pub const STRTAB_SECTION: &str = ".strtab";
pub const DYNSYM_SECTION: &str = ".dynsym";
pub const DYNSTR_SECTION: &str = ".dynstr";
pub const RELA_PLT_SECTION: &str = ".rela.plt";
pub const INIT_ARRAY_SECTION: &str = ".init_array";
pub const FINI_ARRAY_SECTION: &str = ".fini_array";

/// Toolchain-emitted helpers whose symbol-table entry records size zero.
/// Their real extent is fixed, so the reader patches it in by name.
const KNOWN_FUNCTION_SIZES: &[(&str, u64)] = &[
    ("__do_global_dtors_aux", 0x40),
    ("frame_dummy", 0x40),
    ("register_tm_clones", 0x40),
    ("deregister_tm_clones", 0x40),
    ("_fini", 0x0d),
    ("_init", 0x1b),
    ("__restore_rt", 0x09),
];

fn known_size(name: &str) -> Option<u64> {
    KNOWN_FUNCTION_SIZES
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, size)| *size)
}

/// Fixed-size image header, lifted out of the identification bytes and the
/// section-table bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHeader {
    pub magic: [u8; 4],
    pub class: u8,
    pub endianness: u8,
    pub version: u8,
    pub os_abi: u8,
    pub abi_version: u8,
    pub file_type: u16,
    pub machine: u16,
    pub entry_point: u64,
    pub section_table_offset: u64,
    pub section_entry_size: u16,
    pub section_count: u16,
    pub section_names_index: u16,
}

impl ImageHeader {
    fn from_elf(h: &header::Header) -> Self {
        Self {
            magic: [h.e_ident[0], h.e_ident[1], h.e_ident[2], h.e_ident[3]],
            class: h.e_ident[header::EI_CLASS],
            endianness: h.e_ident[header::EI_DATA],
            version: h.e_ident[header::EI_VERSION],
            os_abi: h.e_ident[header::EI_OSABI],
            abi_version: h.e_ident[header::EI_ABIVERSION],
            file_type: h.e_type,
            machine: h.e_machine,
            entry_point: h.e_entry,
            section_table_offset: h.e_shoff,
            section_entry_size: h.e_shentsize,
            section_count: h.e_shnum,
            section_names_index: h.e_shstrndx,
        }
    }
}

/// Section kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    Null,
    ProgramData,
    SymbolTable,
    StringTable,
    RelocationsWithAddend,
    SymbolHashTable,
    Dynamic,
    Note,
    Bss,
    Relocations,
    Reserved,
    DynamicSymbolTable,
    InitArray,
    FiniArray,
    Unknown(u32),
}

fn section_kind_from_elf(sh_type: u32) -> SectionKind {
    match sh_type {
        section_header::SHT_NULL => SectionKind::Null,
        section_header::SHT_PROGBITS => SectionKind::ProgramData,
        section_header::SHT_SYMTAB => SectionKind::SymbolTable,
        section_header::SHT_STRTAB => SectionKind::StringTable,
        section_header::SHT_RELA => SectionKind::RelocationsWithAddend,
        section_header::SHT_HASH => SectionKind::SymbolHashTable,
        section_header::SHT_DYNAMIC => SectionKind::Dynamic,
        section_header::SHT_NOTE => SectionKind::Note,
        section_header::SHT_NOBITS => SectionKind::Bss,
        section_header::SHT_REL => SectionKind::Relocations,
        section_header::SHT_SHLIB => SectionKind::Reserved,
        section_header::SHT_DYNSYM => SectionKind::DynamicSymbolTable,
        section_header::SHT_INIT_ARRAY => SectionKind::InitArray,
        section_header::SHT_FINI_ARRAY => SectionKind::FiniArray,
        other => SectionKind::Unknown(other),
    }
}

/// A named region of the image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub index: usize,
    pub name: String,
    pub kind: SectionKind,
    pub flags: u64,
    /// Loaded virtual address
    pub address: u64,
    /// On-disk file offset
    pub offset: u64,
    pub size: u64,
    /// Index of the associated section (string table, relocated section, ...)
    pub link: u32,
    pub info: u32,
    pub alignment: u64,
    /// Entry size for table-shaped sections
    pub entry_size: u64,
}

/// Symbol kind, the low nibble of the ELF type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    NoType,
    Object,
    Function,
    Section,
    File,
    Common,
    Tls,
    Unknown(u8),
}

fn symbol_kind_from_elf(st_type: u8) -> SymbolKind {
    match st_type {
        sym::STT_NOTYPE => SymbolKind::NoType,
        sym::STT_OBJECT => SymbolKind::Object,
        sym::STT_FUNC => SymbolKind::Function,
        sym::STT_SECTION => SymbolKind::Section,
        sym::STT_FILE => SymbolKind::File,
        sym::STT_COMMON => SymbolKind::Common,
        sym::STT_TLS => SymbolKind::Tls,
        other => SymbolKind::Unknown(other),
    }
}

/// Symbol binding, the high nibble of the ELF type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
    Unknown(u8),
}

fn symbol_binding_from_elf(st_bind: u8) -> SymbolBinding {
    match st_bind {
        sym::STB_LOCAL => SymbolBinding::Local,
        sym::STB_GLOBAL => SymbolBinding::Global,
        sym::STB_WEAK => SymbolBinding::Weak,
        other => SymbolBinding::Unknown(other),
    }
}

/// Symbol information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    /// May be empty (unnamed table entries, section symbols)
    pub name: String,
    pub kind: SymbolKind,
    pub binding: SymbolBinding,
    /// Which section the symbol lives in
    pub section_index: usize,
    /// Virtual address for executables, relative offset otherwise
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn is_function(&self) -> bool {
        self.kind == SymbolKind::Function
    }

    pub fn is_file(&self) -> bool {
        self.kind == SymbolKind::File
    }

    pub fn is_section(&self) -> bool {
        self.kind == SymbolKind::Section
    }

    pub fn is_global(&self) -> bool {
        self.binding == SymbolBinding::Global
    }

    pub fn is_local(&self) -> bool {
        self.binding == SymbolBinding::Local
    }

    pub fn is_weak(&self) -> bool {
        self.binding == SymbolBinding::Weak
    }
}

/// A function materialised from a function-typed symbol: its name, where it
/// loads, and its raw opcode bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub opcodes: Vec<u8>,
}

/// A printable NUL-terminated byte run found in `.rodata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedString {
    pub value: String,
    /// Virtual address of the first byte
    pub address: u64,
}

/// One `.rela.plt` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PltRelocation {
    pub offset: u64,
    pub kind: u32,
    pub symbol_index: usize,
    /// Virtual address of the function this entry relocates (the addend)
    pub target: u64,
}

/// Parsed image. Owns the raw file bytes plus immutable snapshots of every
/// table; one instance per consumer, not shared across threads.
pub struct ElfImage {
    path: PathBuf,
    data: Vec<u8>,
    header: ImageHeader,
    sections: Vec<Section>,
    static_symbols: Vec<Symbol>,
    dynamic_symbols: Vec<Symbol>,
    strings: Vec<EmbeddedString>,
    plt_relocations: Vec<PltRelocation>,
}

impl ElfImage {
    /// Open and fully parse an on-disk image.
    ///
    /// `.symtab`, `.strtab` and `.rodata` must be present; `.dynsym` and
    /// `.rela.plt` are optional and yield empty tables when absent.
    pub fn open<P: AsRef<Path>>(path: P) -> InspectResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path).map_err(|e| InspectError::ImageOpen {
            path: path.clone(),
            source: e,
        })?;

        let (header, sections, static_symbols, dynamic_symbols, plt_relocations) = {
            let elf = Elf::parse(&data)?;
            (
                ImageHeader::from_elf(&elf.header),
                build_sections(&elf),
                build_symbols(elf.syms.iter(), &elf.strtab),
                build_symbols(elf.dynsyms.iter(), &elf.dynstrtab),
                build_plt_relocations(&elf),
            )
        };

        for required in [SYMTAB_SECTION, STRTAB_SECTION, RODATA_SECTION] {
            if !sections.iter().any(|s| s.name == required) {
                return Err(InspectError::MissingSection(required.to_string()));
            }
        }

        let mut image = Self {
            path,
            data,
            header,
            sections,
            static_symbols,
            dynamic_symbols,
            strings: Vec::new(),
            plt_relocations,
        };
        image.strings = image.scan_strings()?;

        info!(
            "parsed image {}: {} sections, {} static symbols, {} dynamic symbols, {} strings",
            image.path.display(),
            image.sections.len(),
            image.static_symbols.len(),
            image.dynamic_symbols.len(),
            image.strings.len()
        );
        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn static_symbols(&self) -> &[Symbol] {
        &self.static_symbols
    }

    pub fn dynamic_symbols(&self) -> &[Symbol] {
        &self.dynamic_symbols
    }

    pub fn strings(&self) -> &[EmbeddedString] {
        &self.strings
    }

    pub fn plt_relocations(&self) -> &[PltRelocation] {
        &self.plt_relocations
    }

    /// True iff the image loads at a kernel-chosen base (shared/PIE file type).
    pub fn is_position_independent(&self) -> bool {
        self.header.file_type == header::ET_DYN
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name == name)
    }

    /// First section with the given name.
    pub fn section(&self, name: &str) -> InspectResult<&Section> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| InspectError::MissingSection(name.to_string()))
    }

    pub fn section_index(&self, name: &str) -> InspectResult<usize> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| InspectError::MissingSection(name.to_string()))
    }

    pub fn section_by_index(&self, index: usize) -> InspectResult<&Section> {
        self.sections
            .get(index)
            .ok_or(InspectError::SectionIndexOutOfBounds {
                index,
                count: self.sections.len(),
            })
    }

    /// Raw bytes of a section. Always `section.size` long; ranges past the
    /// end of the file (`.bss` and friends) read back as zeroes.
    pub fn section_data(&self, name: &str) -> InspectResult<Vec<u8>> {
        let section = self.section(name)?;
        Ok(self.read_bytes_at(section.offset, section.size))
    }

    /// First static symbol with the given name.
    pub fn symbol(&self, name: &str) -> InspectResult<&Symbol> {
        self.static_symbols
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| InspectError::MissingSymbol(name.to_string()))
    }

    /// All static symbols whose kind is not `File`.
    pub fn non_file_symbols(&self) -> Vec<Symbol> {
        self.static_symbols
            .iter()
            .filter(|s| !s.is_file())
            .cloned()
            .collect()
    }

    /// Materialise the named function: seek to its section-relative file
    /// offset and read its recorded (or known-override) size in bytes.
    pub fn function(&self, name: &str) -> InspectResult<Function> {
        let symbol = self.symbol(name)?.clone();
        self.materialize(&symbol)
    }

    /// All static symbols residing entirely within `.text`, `.init` or
    /// `.fini`, each materialised as a `Function`.
    pub fn functions(&self) -> InspectResult<Vec<Function>> {
        let text = self.section(TEXT_SECTION)?;
        let init = self.section(INIT_SECTION)?;
        let fini = self.section(FINI_SECTION)?;

        let resides_in = |section: &Section, symbol: &Symbol| {
            symbol.value >= section.address
                && symbol.value + symbol.size <= section.address + section.size
        };

        self.static_symbols
            .iter()
            .filter(|symbol| {
                resides_in(text, symbol) || resides_in(init, symbol) || resides_in(fini, symbol)
            })
            .map(|symbol| self.materialize(symbol))
            .collect()
    }

    /// Functions referenced by `.rela.plt` entries, matched by the recorded
    /// target address.
    pub fn rela_functions(&self) -> InspectResult<Vec<Function>> {
        let functions = self.functions()?;
        Ok(self
            .plt_relocations
            .iter()
            .filter_map(|relocation| {
                functions
                    .iter()
                    .find(|f| f.address == relocation.target)
                    .cloned()
            })
            .collect())
    }

    /// Functions listed in an 8-byte address array section such as
    /// `.init_array` or `.fini_array`.
    pub fn functions_from_array_section(&self, name: &str) -> InspectResult<Vec<Function>> {
        let data = self.section_data(name)?;
        let functions = self.functions()?;
        Ok(data
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])))
            .filter_map(|address| functions.iter().find(|f| f.address == address).cloned())
            .collect())
    }

    fn materialize(&self, symbol: &Symbol) -> InspectResult<Function> {
        let section = self.section_by_index(symbol.section_index)?;
        let offset = (section.offset + symbol.value).wrapping_sub(section.address);
        let size = known_size(&symbol.name).unwrap_or(symbol.size);

        debug!(
            "materialising {} at {:#x} ({} bytes from file offset {:#x})",
            symbol.name, symbol.value, size, offset
        );
        Ok(Function {
            name: symbol.name.clone(),
            address: symbol.value,
            size,
            opcodes: self.read_bytes_at(offset, size),
        })
    }

    /// Walk `.rodata` recording every NUL-terminated printable run together
    /// with the virtual address of its first byte.
    fn scan_strings(&self) -> InspectResult<Vec<EmbeddedString>> {
        let rodata = self.section(RODATA_SECTION)?;
        let bytes = self.read_bytes_at(rodata.offset, rodata.size);

        let mut strings = Vec::new();
        let mut position = 0;
        while position < bytes.len() {
            let start = position;
            while position < bytes.len() && bytes[position] != 0 {
                position += 1;
            }
            let run = &bytes[start..position];
            if is_valid_string(run) {
                strings.push(EmbeddedString {
                    value: String::from_utf8_lossy(run).into_owned(),
                    address: rodata.address + start as u64,
                });
            }
            position += 1;
        }
        Ok(strings)
    }

    /// Copy `len` bytes at `offset` out of the raw image, zero-padding any
    /// range that falls outside the file.
    fn read_bytes_at(&self, offset: u64, len: u64) -> Vec<u8> {
        let mut buffer = vec![0u8; len as usize];
        let file_len = self.data.len() as u64;
        let start = offset.min(file_len);
        let end = offset.saturating_add(len).min(file_len);
        if start < end {
            let copied = (end - start) as usize;
            buffer[..copied].copy_from_slice(&self.data[start as usize..end as usize]);
        }
        buffer
    }
}

fn build_sections(elf: &Elf) -> Vec<Section> {
    elf.section_headers
        .iter()
        .enumerate()
        .map(|(index, sh)| Section {
            index,
            name: elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string(),
            kind: section_kind_from_elf(sh.sh_type),
            flags: sh.sh_flags,
            address: sh.sh_addr,
            offset: sh.sh_offset,
            size: sh.sh_size,
            link: sh.sh_link,
            info: sh.sh_info,
            alignment: sh.sh_addralign,
            entry_size: sh.sh_entsize,
        })
        .collect()
}

fn build_symbols(
    table: impl Iterator<Item = sym::Sym>,
    names: &goblin::strtab::Strtab,
) -> Vec<Symbol> {
    table
        .map(|s| Symbol {
            name: names.get_at(s.st_name).unwrap_or("").to_string(),
            kind: symbol_kind_from_elf(s.st_type()),
            binding: symbol_binding_from_elf(s.st_bind()),
            section_index: s.st_shndx,
            value: s.st_value,
            size: s.st_size,
        })
        .collect()
}

fn build_plt_relocations(elf: &Elf) -> Vec<PltRelocation> {
    elf.pltrelocs
        .iter()
        .map(|r| PltRelocation {
            offset: r.r_offset,
            kind: r.r_type,
            symbol_index: r.r_sym,
            target: r.r_addend.unwrap_or(0) as u64,
        })
        .collect()
}

/// Validity predicate for embedded strings: non-empty, printable throughout
/// (newline allowed), at least one non-whitespace byte.
fn is_valid_string(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }

    let mut all_whitespace = true;
    for &byte in bytes {
        let printable = (0x20..=0x7e).contains(&byte) || byte == b'\n';
        if !printable {
            return false;
        }
        if all_whitespace {
            all_whitespace = byte.is_ascii_whitespace();
        }
    }
    !all_whitespace
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_image() -> ElfImage {
        let exe = std::env::current_exe().expect("own executable path");
        ElfImage::open(exe).expect("own executable parses")
    }

    #[test]
    fn test_open_missing_file() {
        let result = ElfImage::open("/nonexistent/image");
        assert!(matches!(result, Err(InspectError::ImageOpen { .. })));
    }

    #[test]
    fn test_header_magic_and_class() {
        let image = current_image();
        assert_eq!(image.header().magic, [0x7f, b'E', b'L', b'F']);
        assert_eq!(image.header().class, header::ELFCLASS64);
        assert_eq!(image.header().machine, header::EM_X86_64);
        assert_eq!(image.header().section_count as usize, image.sections().len());
    }

    #[test]
    fn test_section_roundtrip() {
        let image = current_image();
        for section in image.sections() {
            let first = image
                .sections()
                .iter()
                .find(|s| s.name == section.name)
                .unwrap();
            let found = image.section(&section.name).unwrap();
            assert_eq!(found.offset, first.offset);
            assert_eq!(found.size, first.size);

            let data = image.section_data(&section.name).unwrap();
            assert_eq!(data.len() as u64, first.size);
        }
    }

    #[test]
    fn test_section_index_out_of_bounds() {
        let image = current_image();
        let beyond = image.sections().len();
        assert!(matches!(
            image.section_by_index(beyond),
            Err(InspectError::SectionIndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_missing_section_and_symbol() {
        let image = current_image();
        assert!(matches!(
            image.section(".no.such.section"),
            Err(InspectError::MissingSection(_))
        ));
        assert!(matches!(
            image.symbol("no_such_symbol_anywhere"),
            Err(InspectError::MissingSymbol(_))
        ));
        assert!(!image.has_section(".no.such.section"));
        assert!(image.has_section(TEXT_SECTION));
    }

    #[test]
    fn test_functions_contain_main() {
        let image = current_image();
        let functions = image.functions().unwrap();
        assert!(functions.iter().any(|f| f.name == "main"));

        let main = image.function("main").unwrap();
        let symbol = image.symbol("main").unwrap();
        assert_eq!(main.size, symbol.size);
        assert_eq!(main.opcodes.len() as u64, main.size);
    }

    #[test]
    fn test_function_residency() {
        let image = current_image();
        let ranges: Vec<(u64, u64)> = [TEXT_SECTION, INIT_SECTION, FINI_SECTION]
            .iter()
            .map(|name| {
                let s = image.section(name).unwrap();
                (s.address, s.address + s.size)
            })
            .collect();

        for function in image.functions().unwrap() {
            assert_eq!(function.opcodes.len() as u64, function.size);
            assert!(
                ranges
                    .iter()
                    .any(|(lo, hi)| function.address >= *lo
                        && function.address + function.size <= *hi),
                "{} at {:#x} resides in no code section",
                function.name,
                function.address
            );
        }
    }

    #[test]
    fn test_known_size_overrides() {
        assert_eq!(known_size("_init"), Some(0x1b));
        assert_eq!(known_size("_fini"), Some(0x0d));
        assert_eq!(known_size("frame_dummy"), Some(0x40));
        assert_eq!(known_size("__restore_rt"), Some(0x09));
        assert_eq!(known_size("main"), None);

        let image = current_image();
        let init = image.function("_init").unwrap();
        assert_eq!(init.size, 0x1b);
        assert_eq!(init.opcodes.len(), 0x1b);
    }

    #[test]
    fn test_non_file_symbols() {
        let image = current_image();
        for symbol in image.non_file_symbols() {
            assert!(!symbol.is_file());
        }
    }

    #[test]
    fn test_strings_scan() {
        let image = current_image();
        assert!(!image.strings().is_empty());
        let rodata = image.section(RODATA_SECTION).unwrap();
        for string in image.strings() {
            assert!(is_valid_string(string.value.as_bytes()));
            assert!(string.address >= rodata.address);
            assert!(string.address < rodata.address + rodata.size);
        }
    }

    #[test]
    fn test_string_validity() {
        assert!(is_valid_string(b"hello"));
        assert!(is_valid_string(b"two\nlines"));
        assert!(is_valid_string(b" padded "));
        assert!(!is_valid_string(b""));
        assert!(!is_valid_string(b"   "));
        assert!(!is_valid_string(b"\n\n"));
        assert!(!is_valid_string(b"bin\x01ary"));
        assert!(!is_valid_string(b"\x7ftail"));
    }

    #[test]
    fn test_array_section_functions() {
        let image = current_image();
        let functions = image.functions().unwrap();
        for from_array in image
            .functions_from_array_section(INIT_ARRAY_SECTION)
            .unwrap()
        {
            assert!(functions.iter().any(|f| f.address == from_array.address));
        }
    }

    #[test]
    fn test_rela_functions_resolve_against_functions() {
        let image = current_image();
        let functions = image.functions().unwrap();
        for rela in image.rela_functions().unwrap() {
            assert!(functions.iter().any(|f| f.address == rela.address));
        }
    }
}
