use std::collections::HashMap;
use std::fmt;

use crate::isa::Operand;
use crate::wire::{FileHeader, ProgramImage};

/// Builds the bit-packed code section: opcode patterns are written MSB first,
/// numeric fields (register indices, size selectors, constants, addresses)
/// LSB first, matching the reader in `disasm`.
pub struct BitWriter {
    bits: Vec<u8>,
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitWriter {
    pub fn new() -> Self {
        Self { bits: Vec::new() }
    }

    pub fn len_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn push_bits_be(&mut self, value: u64, n: u32) {
        for i in (0..n).rev() {
            self.bits.push(((value >> i) & 1) as u8);
        }
    }

    pub fn push_bits_le(&mut self, value: u64, n: u32) {
        for i in 0..n {
            self.bits.push(((value >> i) & 1) as u8);
        }
    }

    pub fn overwrite_bits_le(&mut self, at: usize, value: u64, n: u32) {
        for i in 0..n {
            self.bits[at + i as usize] = ((value >> i) & 1) as u8;
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.bits.len().div_ceil(8));
        for chunk in self.bits.chunks(8) {
            let mut byte = 0u8;
            for (i, bit) in chunk.iter().enumerate() {
                byte |= bit << (7 - i);
            }
            bytes.push(byte);
        }
        bytes
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, PartialEq, Eq)]
pub enum AsmError {
    UnboundLabel(usize),
    BadOperand(&'static str),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::UnboundLabel(index) => write!(f, "label {index} was never bound"),
            AsmError::BadOperand(what) => write!(f, "bad operand: {what}"),
        }
    }
}

impl std::error::Error for AsmError {}

pub struct ProgramBuilder {
    writer: BitWriter,
    labels: Vec<Option<u32>>,
    patches: Vec<(usize, Label)>,
    data_size: u32,
    initial_data: Vec<u8>,
    error: Option<AsmError>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::new(),
            labels: Vec::new(),
            patches: Vec::new(),
            data_size: 0,
            initial_data: Vec::new(),
            error: None,
        }
    }

    pub fn data_size(&mut self, size: u32) -> &mut Self {
        self.data_size = size;
        self
    }

    pub fn initial_data(&mut self, bytes: &[u8]) -> &mut Self {
        self.initial_data = bytes.to_vec();
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.writer.len_bits() as u32);
        self
    }

    pub fn here(&mut self) -> Label {
        let label = self.new_label();
        self.bind(label);
        label
    }

    fn opcode(&mut self, pattern: u64, len: u32) {
        self.writer.push_bits_be(pattern, len);
    }

    fn data_arg(&mut self, operand: Operand) {
        match operand {
            Operand::Reg(reg) => {
                self.writer.push_bits_be(0, 1);
                self.writer.push_bits_le(u64::from(reg), 4);
            }
            Operand::Mem { reg, size } => {
                let ss = match size {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => {
                        self.error.get_or_insert(AsmError::BadOperand("memory size"));
                        0
                    }
                };
                self.writer.push_bits_be(1, 1);
                self.writer.push_bits_le(ss, 2);
                self.writer.push_bits_le(u64::from(reg), 4);
            }
            _ => {
                self.error.get_or_insert(AsmError::BadOperand("data argument"));
            }
        }
    }

    fn addr_arg(&mut self, label: Label) {
        self.patches.push((self.writer.len_bits(), label));
        self.writer.push_bits_le(0, 32);
    }

    pub fn mov(&mut self, src: Operand, dst: Operand) -> &mut Self {
        self.opcode(0b000, 3);
        self.data_arg(src);
        self.data_arg(dst);
        self
    }

    pub fn load_const(&mut self, value: i64, dst: Operand) -> &mut Self {
        self.opcode(0b001, 3);
        self.writer.push_bits_le(value as u64, 64);
        self.data_arg(dst);
        self
    }

    pub fn add(&mut self, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.arith(0b010001, a, b, dst)
    }

    pub fn sub(&mut self, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.arith(0b010010, a, b, dst)
    }

    pub fn div(&mut self, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.arith(0b010011, a, b, dst)
    }

    pub fn modulo(&mut self, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.arith(0b010100, a, b, dst)
    }

    pub fn mul(&mut self, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.arith(0b010101, a, b, dst)
    }

    fn arith(&mut self, pattern: u64, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.opcode(pattern, 6);
        self.data_arg(a);
        self.data_arg(b);
        self.data_arg(dst);
        self
    }

    pub fn compare(&mut self, a: Operand, b: Operand, dst: Operand) -> &mut Self {
        self.opcode(0b01100, 5);
        self.data_arg(a);
        self.data_arg(b);
        self.data_arg(dst);
        self
    }

    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.opcode(0b01101, 5);
        self.addr_arg(target);
        self
    }

    pub fn jump_equal(&mut self, target: Label, a: Operand, b: Operand) -> &mut Self {
        self.opcode(0b01110, 5);
        self.addr_arg(target);
        self.data_arg(a);
        self.data_arg(b);
        self
    }

    pub fn read(&mut self, ofs: Operand, count: Operand, addr: Operand, dst: Operand) -> &mut Self {
        self.opcode(0b10000, 5);
        self.data_arg(ofs);
        self.data_arg(count);
        self.data_arg(addr);
        self.data_arg(dst);
        self
    }

    pub fn write(&mut self, ofs: Operand, count: Operand, addr: Operand) -> &mut Self {
        self.opcode(0b10001, 5);
        self.data_arg(ofs);
        self.data_arg(count);
        self.data_arg(addr);
        self
    }

    pub fn console_read(&mut self, dst: Operand) -> &mut Self {
        self.opcode(0b10010, 5);
        self.data_arg(dst);
        self
    }

    pub fn console_write(&mut self, src: Operand) -> &mut Self {
        self.opcode(0b10011, 5);
        self.data_arg(src);
        self
    }

    pub fn create_thread(&mut self, target: Label, dst: Operand) -> &mut Self {
        self.opcode(0b10100, 5);
        self.addr_arg(target);
        self.data_arg(dst);
        self
    }

    pub fn join_thread(&mut self, tid: Operand) -> &mut Self {
        self.opcode(0b10101, 5);
        self.data_arg(tid);
        self
    }

    pub fn hlt(&mut self) -> &mut Self {
        self.opcode(0b10110, 5);
        self
    }

    pub fn sleep(&mut self, ms: Operand) -> &mut Self {
        self.opcode(0b10111, 5);
        self.data_arg(ms);
        self
    }

    pub fn call(&mut self, target: Label) -> &mut Self {
        self.opcode(0b1100, 4);
        self.addr_arg(target);
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.opcode(0b1101, 4);
        self
    }

    pub fn lock(&mut self, id: Operand) -> &mut Self {
        self.opcode(0b1110, 4);
        self.data_arg(id);
        self
    }

    pub fn unlock(&mut self, id: Operand) -> &mut Self {
        self.opcode(0b1111, 4);
        self.data_arg(id);
        self
    }

    pub fn build(mut self) -> Result<ProgramImage, AsmError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        for (position, label) in std::mem::take(&mut self.patches) {
            let offset = self.labels[label.0].ok_or(AsmError::UnboundLabel(label.0))?;
            self.writer.overwrite_bits_le(position, u64::from(offset), 32);
        }

        let code = self.writer.into_bytes();
        let data_size = self.data_size.max(self.initial_data.len() as u32);
        Ok(ProgramImage {
            header: FileHeader {
                code_size: code.len() as u32,
                data_size,
                initial_data_size: self.initial_data.len() as u32,
            },
            code,
            initial_data: self.initial_data,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SourceError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for SourceError {}

fn source_error(line: usize, message: impl Into<String>) -> SourceError {
    SourceError {
        line,
        message: message.into(),
    }
}

// mnemonic, opcode bits, bit count, argument kinds (R register/memory,
// C 64-bit constant, L code label)
const OPCODES: &[(&str, u64, u32, &str)] = &[
    ("mov", 0b000, 3, "RR"),
    ("loadConst", 0b001, 3, "CR"),
    ("add", 0b010001, 6, "RRR"),
    ("sub", 0b010010, 6, "RRR"),
    ("div", 0b010011, 6, "RRR"),
    ("mod", 0b010100, 6, "RRR"),
    ("mul", 0b010101, 6, "RRR"),
    ("compare", 0b01100, 5, "RRR"),
    ("jump", 0b01101, 5, "L"),
    ("jumpEqual", 0b01110, 5, "LRR"),
    ("read", 0b10000, 5, "RRRR"),
    ("write", 0b10001, 5, "RRR"),
    ("consoleRead", 0b10010, 5, "R"),
    ("consoleWrite", 0b10011, 5, "R"),
    ("createThread", 0b10100, 5, "LR"),
    ("joinThread", 0b10101, 5, "R"),
    ("hlt", 0b10110, 5, ""),
    ("sleep", 0b10111, 5, "R"),
    ("call", 0b1100, 4, "L"),
    ("ret", 0b1101, 4, ""),
    ("lock", 0b1110, 4, "R"),
    ("unlock", 0b1111, 4, "R"),
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Data,
    Code,
}

struct SourceLabel {
    label: Label,
    bound: bool,
    first_line: usize,
}

/// Assembles the textual form (`.dataSize` / `.data` / `.code` sections,
/// `#` comments, `name:` labels, `r4` and `qword[r4]` operands) into a
/// program image.
pub fn assemble_source(source: &str) -> Result<ProgramImage, SourceError> {
    let mut builder = ProgramBuilder::new();
    let mut labels: HashMap<String, SourceLabel> = HashMap::new();
    let mut section = Section::None;
    let mut data_size: Option<u32> = None;
    let mut data = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let text = raw.split('#').next().unwrap_or("");
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        if tokens[0].starts_with('.') {
            match tokens[0] {
                ".dataSize" => {
                    if data_size.is_some() {
                        return Err(source_error(line_no, "duplicate .dataSize"));
                    }
                    let value = tokens
                        .get(1)
                        .and_then(|token| token.parse::<u32>().ok())
                        .ok_or_else(|| source_error(line_no, "bad .dataSize value"))?;
                    data_size = Some(value);
                }
                ".code" => section = Section::Code,
                ".data" => section = Section::Data,
                other => return Err(source_error(line_no, format!("bad directive '{other}'"))),
            }
            continue;
        }

        if tokens.len() == 1 && tokens[0].ends_with(':') {
            let name = &tokens[0][..tokens[0].len() - 1];
            match section {
                Section::Code => {
                    let entry = labels.entry(name.to_string()).or_insert_with(|| SourceLabel {
                        label: builder.new_label(),
                        bound: false,
                        first_line: line_no,
                    });
                    if entry.bound {
                        return Err(source_error(line_no, format!("duplicate label '{name}'")));
                    }
                    entry.bound = true;
                    let label = entry.label;
                    builder.bind(label);
                }
                Section::Data => {}
                Section::None => return Err(source_error(line_no, "label outside a section")),
            }
            continue;
        }

        match section {
            Section::Code => {
                assemble_instruction(&mut builder, &mut labels, &tokens, line_no)?;
            }
            Section::Data => {
                for token in &tokens {
                    let byte = u8::from_str_radix(token, 16)
                        .map_err(|_| source_error(line_no, format!("bad data byte '{token}'")))?;
                    data.push(byte);
                }
            }
            Section::None => return Err(source_error(line_no, "statement outside a section")),
        }
    }

    for (name, entry) in &labels {
        if !entry.bound {
            return Err(source_error(
                entry.first_line,
                format!("undefined code label '{name}'"),
            ));
        }
    }

    builder.data_size(data_size.unwrap_or(0));
    builder.initial_data(&data);
    builder
        .build()
        .map_err(|err| source_error(0, err.to_string()))
}

fn assemble_instruction(
    builder: &mut ProgramBuilder,
    labels: &mut HashMap<String, SourceLabel>,
    tokens: &[&str],
    line_no: usize,
) -> Result<(), SourceError> {
    let mnemonic = tokens[0];
    let Some(&(_, pattern, bits, kinds)) =
        OPCODES.iter().find(|(name, _, _, _)| *name == mnemonic)
    else {
        return Err(source_error(line_no, format!("bad opcode '{mnemonic}'")));
    };

    let rest = tokens[1..].join(" ");
    let args: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',').map(str::trim).collect()
    };
    if args.len() != kinds.len() {
        return Err(source_error(
            line_no,
            format!("{mnemonic} expects {} arguments, got {}", kinds.len(), args.len()),
        ));
    }

    builder.opcode(pattern, bits);
    for (kind, arg) in kinds.chars().zip(&args) {
        match kind {
            'R' => {
                let operand = parse_value_operand(arg, line_no)?;
                builder.data_arg(operand);
            }
            'C' => {
                let value = parse_constant(arg, line_no)?;
                builder.writer.push_bits_le(value as u64, 64);
            }
            'L' => {
                let entry = labels.entry((*arg).to_string()).or_insert_with(|| SourceLabel {
                    label: builder.new_label(),
                    bound: false,
                    first_line: line_no,
                });
                let label = entry.label;
                builder.addr_arg(label);
            }
            _ => unreachable!("unknown argument kind"),
        }
    }
    Ok(())
}

fn parse_register(text: &str, line_no: usize) -> Result<u8, SourceError> {
    let id = text
        .strip_prefix('r')
        .and_then(|digits| digits.parse::<u8>().ok())
        .ok_or_else(|| source_error(line_no, format!("bad register '{text}'")))?;
    if id > 15 {
        return Err(source_error(line_no, format!("register id {id} out of range")));
    }
    Ok(id)
}

fn parse_value_operand(text: &str, line_no: usize) -> Result<Operand, SourceError> {
    if let Some((prefix, rest)) = text.split_once('[') {
        let size = match prefix.trim() {
            "byte" => 1,
            "word" => 2,
            "dword" => 4,
            "qword" => 8,
            other => {
                return Err(source_error(line_no, format!("bad access size '{other}'")));
            }
        };
        let inner = rest
            .strip_suffix(']')
            .ok_or_else(|| source_error(line_no, format!("bad memory operand '{text}'")))?;
        let reg = parse_register(inner.trim(), line_no)?;
        return Ok(Operand::Mem { reg, size });
    }
    Ok(Operand::Reg(parse_register(text, line_no)?))
}

fn parse_constant(text: &str, line_no: usize) -> Result<i64, SourceError> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    }
    .map_err(|_| source_error(line_no, format!("bad constant '{text}'")))?;
    let value = magnitude as i64;
    Ok(if negative { value.wrapping_neg() } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;
    use crate::isa::{Op, Operand::*};

    #[test]
    fn round_trips_through_disassembler() {
        let mut builder = ProgramBuilder::new();
        let loop_top = builder.new_label();
        builder.load_const(1, Reg(0));
        builder.load_const(10, Reg(1));
        builder.bind(loop_top);
        builder.console_write(Reg(0));
        builder.add(Reg(0), Reg(1), Reg(2));
        builder.compare(Reg(0), Reg(1), Reg(3));
        builder.jump_equal(loop_top, Reg(3), Reg(0));
        builder.hlt();
        let image = builder.build().expect("build should succeed");

        let out = disassemble(&image.code);
        assert_eq!(out.len(), 7);
        assert_eq!(out[0].opcode, Op::LoadConst);
        assert_eq!(out[0].args, vec![Const(1), Reg(0)]);
        assert_eq!(out[2].opcode, Op::ConsoleWrite);
        assert_eq!(out[5].opcode, Op::JumpEq);
        assert_eq!(out[5].args[0], Addr(out[2].bit_offset));
        assert_eq!(out[6].opcode, Op::Hlt);
    }

    #[test]
    fn forward_labels_are_patched() {
        let mut builder = ProgramBuilder::new();
        let end = builder.new_label();
        builder.jump(end);
        builder.console_write(Reg(0));
        builder.bind(end);
        builder.hlt();
        let image = builder.build().expect("build should succeed");

        let out = disassemble(&image.code);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].args[0], Addr(out[2].bit_offset));
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut builder = ProgramBuilder::new();
        let nowhere = builder.new_label();
        builder.jump(nowhere);
        let err = builder.build().expect_err("build should fail");
        assert_eq!(err, AsmError::UnboundLabel(0));
    }

    #[test]
    fn memory_operands_round_trip() {
        let mut builder = ProgramBuilder::new();
        builder.data_size(64);
        builder.mov(Mem { reg: 1, size: 2 }, Reg(4));
        builder.mov(Reg(4), Mem { reg: 1, size: 8 });
        builder.hlt();
        let image = builder.build().expect("build should succeed");

        let out = disassemble(&image.code);
        assert_eq!(out[0].args, vec![Mem { reg: 1, size: 2 }, Reg(4)]);
        assert_eq!(out[1].args, vec![Reg(4), Mem { reg: 1, size: 8 }]);
        assert_eq!(image.header.data_size, 64);
    }

    #[test]
    fn header_covers_initial_data() {
        let mut builder = ProgramBuilder::new();
        builder.initial_data(&[1, 2, 3, 4]);
        builder.hlt();
        let image = builder.build().expect("build should succeed");
        assert_eq!(image.header.initial_data_size, 4);
        assert_eq!(image.header.data_size, 4);
    }

    #[test]
    fn assembles_source_with_labels_and_sections() {
        let source = "\
.dataSize 64
.data
de ad be ef
.code
    loadConst 0x2a, r0   # forty-two
loop:
    consoleWrite r0
    sub r0, r1, r0
    jumpEqual loop, r0, r1
    hlt
";
        let image = assemble_source(source).expect("assembly should succeed");
        assert_eq!(image.header.data_size, 64);
        assert_eq!(image.initial_data, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let out = disassemble(&image.code);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].opcode, Op::LoadConst);
        assert_eq!(out[0].args, vec![Const(42), Reg(0)]);
        assert_eq!(out[1].opcode, Op::ConsoleWrite);
        assert_eq!(out[3].opcode, Op::JumpEq);
        assert_eq!(out[3].args[0], Addr(out[1].bit_offset));
        assert_eq!(out[4].opcode, Op::Hlt);
    }

    #[test]
    fn assembles_memory_operands_and_negative_constants() {
        let source = "\
.code
    loadConst -1, r2
    mov qword[r2], r3
    mov r3, byte[r2]
    hlt
";
        let image = assemble_source(source).expect("assembly should succeed");
        let out = disassemble(&image.code);
        assert_eq!(out[0].args, vec![Const(-1), Reg(2)]);
        assert_eq!(out[1].args, vec![Mem { reg: 2, size: 8 }, Reg(3)]);
        assert_eq!(out[2].args, vec![Reg(3), Mem { reg: 2, size: 1 }]);
    }

    #[test]
    fn source_forward_references_resolve() {
        let source = "\
.code
    jump end
    consoleWrite r0
end:
    hlt
";
        let image = assemble_source(source).expect("assembly should succeed");
        let out = disassemble(&image.code);
        assert_eq!(out[0].args[0], Addr(out[2].bit_offset));
    }

    #[test]
    fn source_errors_carry_line_numbers() {
        let err = assemble_source(".code\n    frobnicate r0\n").expect_err("bad opcode");
        assert_eq!(err.line, 2);
        assert!(err.message.contains("bad opcode"));

        let err = assemble_source(".code\n    add r0, r1\n").expect_err("bad arity");
        assert!(err.message.contains("expects 3 arguments"));

        let err = assemble_source(".code\n    consoleWrite r16\n").expect_err("bad register");
        assert!(err.message.contains("out of range"));

        let err = assemble_source(".code\n    jump nowhere\n").expect_err("undefined label");
        assert!(err.message.contains("undefined code label 'nowhere'"));

        let err =
            assemble_source(".code\na:\na:\n    hlt\n").expect_err("duplicate label");
        assert!(err.message.contains("duplicate label"));

        let err = assemble_source("    hlt\n").expect_err("no section");
        assert!(err.message.contains("outside a section"));
    }
}
