//! # Disassembler
//!
//! Decodes a byte buffer into annotated instruction lines (x86-64, Intel
//! syntax) and resolves call targets and RIP-relative loads against the
//! image's symbol tables and embedded strings.

use std::collections::HashMap;

use capstone::arch::x86::{ArchMode, ArchSyntax};
use capstone::arch::BuildsCapstone;
use capstone::arch::BuildsCapstoneSyntax;
use capstone::Capstone;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::elf::{EmbeddedString, Symbol};
use crate::error::{InspectError, InspectResult};

/// Mnemonics classified as jumps.
const JUMP_MNEMONICS: &[&str] = &["jmp", "je", "jne", "jg", "jl", "jge", "jle"];

/// Resolved string comments are cut at this many characters.
const MAX_STRING_COMMENT: usize = 15;

/// One decoded instruction. `operands` carries the resolved-reference
/// comment, when any, appended to the operand text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionLine {
    pub opcodes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub address: u64,
    pub is_jump: bool,
}

/// Addresses of every call instruction in a disassembled line list, usable
/// as the call-site list for a single-function observation run.
pub fn call_sites(lines: &[InstructionLine]) -> Vec<u64> {
    lines
        .iter()
        .filter(|line| line.mnemonic.starts_with("call"))
        .map(|line| line.address)
        .collect()
}

fn is_jump(mnemonic: &str) -> bool {
    JUMP_MNEMONICS.contains(&mnemonic)
}

/// Address-keyed lookup tables built once per disassembly pass. First entry
/// wins on duplicate addresses, matching table order.
struct AddressTables<'a> {
    static_names: HashMap<u64, &'a str>,
    dynamic_names: HashMap<u64, &'a str>,
    strings: HashMap<u64, &'a str>,
}

impl<'a> AddressTables<'a> {
    fn build(
        static_symbols: &'a [Symbol],
        dynamic_symbols: &'a [Symbol],
        strings: &'a [EmbeddedString],
    ) -> Self {
        let mut static_names = HashMap::with_capacity(static_symbols.len());
        for symbol in static_symbols {
            static_names
                .entry(symbol.value)
                .or_insert(symbol.name.as_str());
        }
        let mut dynamic_names = HashMap::with_capacity(dynamic_symbols.len());
        for symbol in dynamic_symbols {
            dynamic_names
                .entry(symbol.value)
                .or_insert(symbol.name.as_str());
        }
        let mut string_values = HashMap::with_capacity(strings.len());
        for string in strings {
            string_values
                .entry(string.address)
                .or_insert(string.value.as_str());
        }
        Self {
            static_names,
            dynamic_names,
            strings: string_values,
        }
    }

    /// Static symbols win over dynamic ones; dynamic hits are marked external.
    fn resolve_symbol(&self, address: u64) -> Option<String> {
        if let Some(name) = self.static_names.get(&address) {
            return Some(format!(" <{name}>"));
        }
        if let Some(name) = self.dynamic_names.get(&address) {
            return Some(format!(" <{name}/external>"));
        }
        None
    }

    /// Full fallback chain: symbols, then strings, then the bare address.
    fn resolve_address(&self, address: u64) -> String {
        if let Some(symbol) = self.resolve_symbol(address) {
            return symbol;
        }
        if let Some(value) = self.strings.get(&address) {
            return format!(" \"{}\"", truncate_string(value));
        }
        format!(" {address}")
    }
}

fn truncate_string(value: &str) -> String {
    if value.chars().count() > MAX_STRING_COMMENT {
        let head: String = value.chars().take(MAX_STRING_COMMENT - 3).collect();
        format!("{head}...")
    } else {
        value.to_string()
    }
}

/// Capstone-backed decoder. One instance per thread; decoding is synchronous.
pub struct Disassembler {
    engine: Capstone,
    hex_literal: Regex,
    rip_operand: Regex,
}

impl Disassembler {
    pub fn new() -> InspectResult<Self> {
        let engine = Capstone::new()
            .x86()
            .mode(ArchMode::Mode64)
            .syntax(ArchSyntax::Intel)
            .build()
            .map_err(|e| InspectError::DisassemblerOpen(e.to_string()))?;

        Ok(Self {
            engine,
            hex_literal: Regex::new(r"^0x[0-9a-f]+$")
                .map_err(|e| InspectError::DisassemblerOpen(e.to_string()))?,
            rip_operand: Regex::new(r"\[rip ([+-]) 0x([0-9a-f]+)\]")
                .map_err(|e| InspectError::DisassemblerOpen(e.to_string()))?,
        })
    }

    /// Decode `buffer` as if loaded at `base_address`. Every decoded byte is
    /// accounted for in the returned lines.
    pub fn disassemble(
        &self,
        buffer: &[u8],
        base_address: u64,
        static_symbols: &[Symbol],
        dynamic_symbols: &[Symbol],
        strings: &[EmbeddedString],
    ) -> InspectResult<Vec<InstructionLine>> {
        let instructions = self
            .engine
            .disasm_all(buffer, base_address)
            .map_err(|e| InspectError::DisassemblerParse(e.to_string()))?;

        let tables = AddressTables::build(static_symbols, dynamic_symbols, strings);

        let mut lines = Vec::with_capacity(instructions.len());
        for instruction in instructions.iter() {
            let mnemonic = instruction.mnemonic().unwrap_or("").to_string();
            let operands = instruction.op_str().unwrap_or("");
            let next_address = instruction.address() + instruction.bytes().len() as u64;
            let comment = self.comment(&mnemonic, operands, next_address, &tables);

            lines.push(InstructionLine {
                opcodes: instruction.bytes().to_vec(),
                is_jump: is_jump(&mnemonic),
                operands: format!("{operands}{comment}"),
                address: instruction.address(),
                mnemonic,
            });
        }
        Ok(lines)
    }

    /// Two annotation cases, in order: a direct call to a bare hex literal,
    /// then a RIP-relative `lea`. Anything else gets no comment.
    fn comment(
        &self,
        mnemonic: &str,
        operands: &str,
        next_address: u64,
        tables: &AddressTables,
    ) -> String {
        if mnemonic.starts_with("call") && self.hex_literal.is_match(operands) {
            let target = u64::from_str_radix(operands.trim_start_matches("0x"), 16).unwrap_or(0);
            return tables.resolve_symbol(target).unwrap_or_default();
        }
        if mnemonic.starts_with("lea") {
            let target = next_address.wrapping_add(self.rip_displacement(operands) as u64);
            return tables.resolve_address(target);
        }
        String::new()
    }

    /// Signed displacement of a `[rip ± 0xNN]` operand; zero when the operand
    /// has no such form.
    fn rip_displacement(&self, operands: &str) -> i64 {
        match self.rip_operand.captures(operands) {
            Some(captures) => {
                let magnitude = i64::from_str_radix(&captures[2], 16).unwrap_or(0);
                if &captures[1] == "-" {
                    -magnitude
                } else {
                    magnitude
                }
            }
            None => 0,
        }
    }
}
