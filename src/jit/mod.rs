use std::collections::HashMap;
use std::fmt;

pub mod arm64;
pub mod builder;
#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
pub mod exec;

pub use builder::{ENTRY_OFFSET, JitBuilder, MAX_CODE_BYTES};
#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
pub use exec::{ExecutableCode, JitEntry};

use crate::host::HostInterface;
use crate::isa::{Instruction, Op, Operand};

#[derive(Debug)]
pub enum JitError {
    Arity {
        op: Op,
        expected: usize,
        got: usize,
    },
    BadOperandKind {
        op: Op,
        operand: Operand,
    },
    UnsupportedOperand {
        what: &'static str,
        operand: Operand,
    },
    ConflictingLabel(u32),
    UnknownBranchTarget(u32),
    BranchOutOfRange {
        at: usize,
        target: usize,
    },
    ThreadEntryOutOfRange(usize),
    PatchSiteMismatch {
        at: usize,
        word: u32,
    },
    PatchOutOfBounds {
        at: usize,
        len: usize,
    },
    CodeTooLarge(usize),
    PayloadRequired(Op),
    Native(String),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::Arity { op, expected, got } => {
                write!(f, "{op} expects {expected} operands, got {got}")
            }
            JitError::BadOperandKind { op, operand } => {
                write!(f, "{op} cannot take operand {operand}")
            }
            JitError::UnsupportedOperand { what, operand } => {
                write!(f, "cannot {what} operand {operand}")
            }
            JitError::ConflictingLabel(bits) => write!(
                f,
                "bit offset {bits} is both a call target and a jump target"
            ),
            JitError::UnknownBranchTarget(bits) => {
                write!(f, "branch target bit offset {bits} is not an instruction")
            }
            JitError::BranchOutOfRange { at, target } => {
                write!(f, "branch at native index {at} cannot reach {target}")
            }
            JitError::ThreadEntryOutOfRange(index) => write!(
                f,
                "thread entry native index {index} exceeds the 16-bit immediate"
            ),
            JitError::PatchSiteMismatch { at, word } => {
                write!(f, "word {word:#010X} at native index {at} is not patchable")
            }
            JitError::PatchOutOfBounds { at, len } => {
                write!(f, "patch index {at} out of bounds for {len} emitted words")
            }
            JitError::CodeTooLarge(bytes) => {
                write!(f, "generated code of {bytes} bytes exceeds the branch range")
            }
            JitError::PayloadRequired(op) => {
                write!(f, "{op} requires a payload file argument")
            }
            JitError::Native(message) => write!(f, "native code error: {message}"),
        }
    }
}

impl std::error::Error for JitError {}

pub type JitResult<T> = Result<T, JitError>;

#[derive(Clone, Copy, Debug, Default)]
pub struct TranslateOptions {
    pub payload_available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LabelKind {
    Jump,
    Call,
}

/// The emitted code vector together with the total map from instruction bit
/// offsets to native code indices. Publication to executable memory is a
/// separate step so translation stays testable off-target.
#[derive(Debug)]
pub struct TranslatedProgram {
    code: Vec<u32>,
    bit_to_native: HashMap<u32, usize>,
}

impl TranslatedProgram {
    pub fn code(&self) -> &[u32] {
        &self.code
    }

    pub fn native_index(&self, bit_offset: u32) -> Option<usize> {
        self.bit_to_native.get(&bit_offset).copied()
    }

    pub fn entry_index(&self) -> usize {
        ENTRY_OFFSET
    }

    #[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
    pub fn publish(&self) -> JitResult<ExecutableCode> {
        ExecutableCode::from_words(&self.code)
    }

    /// Hex dump of the emitted words, one per line with its byte offset.
    pub fn render_words(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Generated code ({} instructions, {} bytes):",
            self.code.len(),
            self.code.len() * 4
        );
        for (index, word) in self.code.iter().enumerate() {
            let _ = writeln!(out, "{:04x}: {:08x}", index * 4, word);
        }
        out
    }
}

fn args_exact<'a>(ins: &'a Instruction, expected: usize) -> JitResult<&'a [Operand]> {
    if ins.args.len() != expected {
        return Err(JitError::Arity {
            op: ins.opcode,
            expected,
            got: ins.args.len(),
        });
    }
    Ok(&ins.args)
}

fn value_operand<'a>(op: Op, operand: &'a Operand) -> JitResult<&'a Operand> {
    if operand.is_value() {
        Ok(operand)
    } else {
        Err(JitError::BadOperandKind {
            op,
            operand: *operand,
        })
    }
}

fn addr_operand(op: Op, operand: &Operand) -> JitResult<u32> {
    match operand {
        Operand::Addr(bits) => Ok(*bits),
        other => Err(JitError::BadOperandKind {
            op,
            operand: *other,
        }),
    }
}

/// An address reached by a CALL needs a function prologue; one reached by a
/// jump or used as a thread entry must not get one, since branching into a
/// prologue would push a spurious frame. An address claimed both ways is
/// rejected.
fn scan_labels(instructions: &[Instruction]) -> JitResult<HashMap<u32, LabelKind>> {
    let mut labels = HashMap::new();
    for ins in instructions {
        let kind = match ins.opcode {
            Op::JumpEq | Op::Jump | Op::CreateThread => LabelKind::Jump,
            Op::Call => LabelKind::Call,
            _ => continue,
        };
        let target = addr_operand(
            ins.opcode,
            ins.args.first().ok_or(JitError::Arity {
                op: ins.opcode,
                expected: 1,
                got: 0,
            })?,
        )?;
        match labels.insert(target, kind) {
            Some(previous) if previous != kind => {
                return Err(JitError::ConflictingLabel(target));
            }
            _ => {}
        }
    }
    Ok(labels)
}

/// One pass over the decoded instructions: emit per-opcode sequences, record
/// the bit-offset to native-index map, collect branch and thread-entry
/// fixups, then patch and seal the code vector.
pub fn translate(
    instructions: &[Instruction],
    host: &HostInterface,
    options: &TranslateOptions,
) -> JitResult<TranslatedProgram> {
    let labels = scan_labels(instructions)?;

    let mut builder = JitBuilder::new();
    let mut bit_to_native: HashMap<u32, usize> = HashMap::new();
    let mut fixups: Vec<(usize, u32)> = Vec::new();

    for ins in instructions {
        bit_to_native.insert(ins.bit_offset, builder.current_index());
        if labels.get(&ins.bit_offset) == Some(&LabelKind::Call) {
            builder.func_prologue();
        }

        let op = ins.opcode;
        match op {
            Op::LoadConst => {
                let args = args_exact(ins, 2)?;
                let value = match args[0] {
                    Operand::Const(value) => value,
                    other => return Err(JitError::BadOperandKind { op, operand: other }),
                };
                builder.load_immediate(value_operand(op, &args[1])?, value)?;
            }
            Op::Mov => {
                let args = args_exact(ins, 2)?;
                builder.mov(value_operand(op, &args[1])?, value_operand(op, &args[0])?)?;
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let args = args_exact(ins, 3)?;
                let a = value_operand(op, &args[0])?;
                let b = value_operand(op, &args[1])?;
                let dst = value_operand(op, &args[2])?;
                match op {
                    Op::Add => builder.add(dst, a, b)?,
                    Op::Sub => builder.sub(dst, a, b)?,
                    Op::Mul => builder.mul(dst, a, b)?,
                    Op::Div => builder.div(dst, a, b)?,
                    Op::Mod => builder.modulo(dst, a, b)?,
                    _ => unreachable!(),
                }
            }
            Op::Compare => {
                let args = args_exact(ins, 3)?;
                let dst = value_operand(op, &args[2])?;
                builder.sub(dst, value_operand(op, &args[0])?, value_operand(op, &args[1])?)?;
                builder.signum(dst, dst)?;
            }
            Op::JumpEq => {
                let args = args_exact(ins, 3)?;
                let target = addr_operand(op, &args[0])?;
                builder.compare(value_operand(op, &args[1])?, value_operand(op, &args[2])?)?;
                fixups.push((builder.branch_if_equal(), target));
            }
            Op::Jump => {
                let args = args_exact(ins, 1)?;
                let target = addr_operand(op, &args[0])?;
                fixups.push((builder.jump(), target));
            }
            Op::Call => {
                let args = args_exact(ins, 1)?;
                let target = addr_operand(op, &args[0])?;
                fixups.push((builder.call(), target));
            }
            Op::Ret => {
                args_exact(ins, 0)?;
                builder.func_epilogue();
                builder.ret();
            }
            Op::ConsoleRead => {
                let args = args_exact(ins, 1)?;
                builder.host_call_with_ops(
                    host.read_value as usize as u64,
                    value_operand(op, &args[0])?,
                    [&Operand::None; 4],
                )?;
            }
            Op::ConsoleWrite => {
                let args = args_exact(ins, 1)?;
                builder.host_call_with_ops(
                    host.print_value as usize as u64,
                    &Operand::None,
                    [value_operand(op, &args[0])?, &Operand::None, &Operand::None, &Operand::None],
                )?;
            }
            Op::Hlt => {
                args_exact(ins, 0)?;
                builder.host_call_with_ops(
                    host.terminate as usize as u64,
                    &Operand::None,
                    [&Operand::None; 4],
                )?;
            }
            Op::Sleep => {
                let args = args_exact(ins, 1)?;
                builder.host_call_with_ops(
                    host.thread_sleep as usize as u64,
                    &Operand::None,
                    [value_operand(op, &args[0])?, &Operand::None, &Operand::None, &Operand::None],
                )?;
            }
            Op::CreateThread => {
                let args = args_exact(ins, 2)?;
                let target = addr_operand(op, &args[0])?;
                let site = builder.host_call_with_ops(
                    host.thread_create as usize as u64,
                    value_operand(op, &args[1])?,
                    [&Operand::Addr(target), &Operand::None, &Operand::None, &Operand::None],
                )?;
                fixups.push((site, target));
            }
            Op::JoinThread => {
                let args = args_exact(ins, 1)?;
                builder.host_call_with_ops(
                    host.thread_join as usize as u64,
                    &Operand::None,
                    [value_operand(op, &args[0])?, &Operand::None, &Operand::None, &Operand::None],
                )?;
            }
            Op::Lock | Op::Unlock => {
                let args = args_exact(ins, 1)?;
                let func = if op == Op::Lock {
                    host.thread_lock
                } else {
                    host.thread_unlock
                };
                builder.host_call_with_ops(
                    func as usize as u64,
                    &Operand::None,
                    [value_operand(op, &args[0])?, &Operand::None, &Operand::None, &Operand::None],
                )?;
            }
            Op::Read => {
                let args = args_exact(ins, 4)?;
                if !options.payload_available {
                    return Err(JitError::PayloadRequired(op));
                }
                builder.host_call_with_ops(
                    host.file_read as usize as u64,
                    value_operand(op, &args[3])?,
                    [
                        value_operand(op, &args[0])?,
                        value_operand(op, &args[1])?,
                        value_operand(op, &args[2])?,
                        &Operand::None,
                    ],
                )?;
            }
            Op::Write => {
                let args = args_exact(ins, 3)?;
                if !options.payload_available {
                    return Err(JitError::PayloadRequired(op));
                }
                builder.host_call_with_ops(
                    host.file_write as usize as u64,
                    &Operand::None,
                    [
                        value_operand(op, &args[0])?,
                        value_operand(op, &args[1])?,
                        value_operand(op, &args[2])?,
                        &Operand::None,
                    ],
                )?;
            }
        }

        builder.nop();
        if builder.code_bytes() > MAX_CODE_BYTES {
            return Err(JitError::CodeTooLarge(builder.code_bytes()));
        }
    }

    builder.end()?;

    for (at, target_bits) in fixups {
        let native = *bit_to_native
            .get(&target_bits)
            .ok_or(JitError::UnknownBranchTarget(target_bits))?;
        builder.patch_branch_or_imm(at, native)?;
    }

    Ok(TranslatedProgram {
        code: builder.into_code(),
        bit_to_native,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;
    use crate::isa::Operand::*;
    use crate::jit::arm64;

    fn ins(bit_offset: u32, opcode: Op, args: Vec<Operand>) -> Instruction {
        Instruction {
            bit_offset,
            opcode,
            args,
        }
    }

    fn translate_ok(instructions: &[Instruction]) -> TranslatedProgram {
        translate(
            instructions,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect("translation should succeed")
    }

    #[test]
    fn maps_every_instruction_below_code_len() {
        let program = vec![
            ins(0, Op::LoadConst, vec![Const(7), Reg(0)]),
            ins(72, Op::ConsoleWrite, vec![Reg(0)]),
            ins(82, Op::Hlt, vec![]),
        ];
        let translated = translate_ok(&program);
        for i in &program {
            let native = translated
                .native_index(i.bit_offset)
                .expect("every instruction must be mapped");
            assert!(native < translated.code().len());
        }
        assert_eq!(translated.native_index(0), Some(ENTRY_OFFSET));
    }

    #[test]
    fn emits_nop_after_every_instruction() {
        let program = vec![
            ins(0, Op::LoadConst, vec![Const(1), Reg(0)]),
            ins(72, Op::Mov, vec![Reg(0), Reg(1)]),
        ];
        let translated = translate_ok(&program);
        let second = translated.native_index(72).expect("mapped");
        assert_eq!(translated.code()[second - 1], arm64::nop());
    }

    #[test]
    fn call_targets_get_a_prologue_and_jump_targets_do_not() {
        // 0: call 100; 1: hlt; 100: ret   plus   jumpEqual to 200; 200: hlt
        let program = vec![
            ins(0, Op::Call, vec![Addr(100)]),
            ins(37, Op::JumpEq, vec![Addr(200), Reg(0), Reg(1)]),
            ins(90, Op::Hlt, vec![]),
            ins(100, Op::Ret, vec![]),
            ins(200, Op::Hlt, vec![]),
        ];
        let translated = translate_ok(&program);

        let call_target = translated.native_index(100).expect("mapped");
        assert_eq!(
            &translated.code()[call_target..call_target + 2],
            &[arm64::sub_x_imm(31, 31, 16), arm64::str_x_imm(30, 31, 0)]
        );

        let jump_target = translated.native_index(200).expect("mapped");
        assert_ne!(translated.code()[jump_target], arm64::sub_x_imm(31, 31, 16));
    }

    #[test]
    fn rejects_address_that_is_both_called_and_jumped() {
        let program = vec![
            ins(0, Op::Call, vec![Addr(100)]),
            ins(37, Op::JumpEq, vec![Addr(100), Reg(0), Reg(1)]),
            ins(100, Op::Ret, vec![]),
        ];
        let err = translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect_err("conflicting label kinds must be rejected");
        assert!(matches!(err, JitError::ConflictingLabel(100)));
    }

    #[test]
    fn rejects_thread_entry_into_called_label() {
        let program = vec![
            ins(0, Op::Call, vec![Addr(100)]),
            ins(37, Op::CreateThread, vec![Addr(100), Reg(0)]),
            ins(100, Op::Ret, vec![]),
        ];
        let err = translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect_err("thread entry into a prologue must be rejected");
        assert!(matches!(err, JitError::ConflictingLabel(100)));
    }

    #[test]
    fn forward_jump_is_patched_to_target_index() {
        let program = vec![
            ins(0, Op::Jump, vec![Addr(50)]),
            ins(37, Op::LoadConst, vec![Const(9), Reg(0)]),
            ins(50, Op::Hlt, vec![]),
        ];
        let translated = translate_ok(&program);
        let jump_at = translated.native_index(0).expect("mapped");
        let target = translated.native_index(50).expect("mapped");
        let expected = arm64::b((target - jump_at) as i32);
        assert_eq!(translated.code()[jump_at], expected);
    }

    #[test]
    fn backward_jumpeq_displacement_is_negative() {
        let program = vec![
            ins(0, Op::LoadConst, vec![Const(0), Reg(0)]),
            ins(72, Op::JumpEq, vec![Addr(0), Reg(0), Reg(1)]),
        ];
        let translated = translate_ok(&program);
        let site = translated.native_index(72).expect("mapped");
        // compare is ldr, ldr, cmp; branch is the fourth word
        let branch_at = site + 3;
        let word = translated.code()[branch_at];
        assert_eq!(word & 0xFF00_001F, 0x5400_0000);
        let imm19 = ((word >> 5) & 0x7FFFF) as i32;
        let offset = (imm19 << 13) >> 13;
        assert_eq!(offset, ENTRY_OFFSET as i32 - branch_at as i32);
    }

    #[test]
    fn create_thread_immediate_is_patched_to_native_index() {
        let program = vec![
            ins(0, Op::CreateThread, vec![Addr(60), Reg(2)]),
            ins(42, Op::Hlt, vec![]),
            ins(60, Op::ConsoleWrite, vec![Reg(3)]),
        ];
        let translated = translate_ok(&program);
        let site = translated.native_index(0).expect("mapped");
        let entry = translated.native_index(60).expect("mapped");
        assert_eq!(
            translated.code()[site],
            arm64::movz_x(0, entry as u16, 0),
            "thread entry must be rewritten into the MOVZ immediate"
        );
    }

    #[test]
    fn unknown_branch_target_is_fatal() {
        let program = vec![ins(0, Op::Jump, vec![Addr(999)])];
        let err = translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect_err("unknown target must be fatal");
        assert!(matches!(err, JitError::UnknownBranchTarget(999)));
    }

    #[test]
    fn arity_mismatch_aborts_translation() {
        let program = vec![ins(0, Op::Add, vec![Reg(0), Reg(1)])];
        let err = translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect_err("bad arity must abort");
        assert!(matches!(
            err,
            JitError::Arity {
                op: Op::Add,
                expected: 3,
                got: 2
            }
        ));
    }

    #[test]
    fn operand_kind_mismatch_aborts_translation() {
        let program = vec![ins(0, Op::ConsoleWrite, vec![Addr(8)])];
        let err = translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect_err("address operand to consoleWrite must abort");
        assert!(matches!(err, JitError::BadOperandKind { .. }));
    }

    #[test]
    fn file_ops_require_payload() {
        let program = vec![ins(
            0,
            Op::Read,
            vec![Reg(0), Reg(1), Reg(2), Reg(3)],
        )];
        let err = translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions::default(),
        )
        .expect_err("read without payload must fail");
        assert!(matches!(err, JitError::PayloadRequired(Op::Read)));

        translate(
            &program,
            &HostInterface::native(),
            &TranslateOptions {
                payload_available: true,
            },
        )
        .expect("read with payload should translate");
    }

    #[test]
    fn render_words_lists_every_word_with_byte_offsets() {
        let translated = translate_ok(&[ins(0, Op::Hlt, vec![])]);
        let text = translated.render_words();
        assert!(text.starts_with(&format!(
            "Generated code ({} instructions, {} bytes):",
            translated.code().len(),
            translated.code().len() * 4
        )));
        assert!(text.contains("0000: "));
        assert_eq!(text.lines().count(), translated.code().len() + 1);
    }

    #[test]
    fn translates_a_disassembled_program() {
        let mut builder = crate::asm::ProgramBuilder::new();
        let looptop = builder.new_label();
        builder.load_const(1, Reg(0));
        builder.load_const(10, Reg(1));
        builder.bind(looptop);
        builder.console_write(Reg(0));
        builder.add(Reg(0), Reg(1), Reg(2));
        builder.jump_equal(looptop, Reg(2), Reg(1));
        builder.hlt();
        let image = builder.build().expect("assembly should succeed");

        let instructions = disassemble(&image.code);
        assert_eq!(instructions.len(), 6);
        let translated = translate_ok(&instructions);
        assert!(translated.code().len() > ENTRY_OFFSET);
        for i in &instructions {
            assert!(translated.native_index(i.bit_offset).is_some());
        }
    }
}
