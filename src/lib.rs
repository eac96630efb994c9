pub mod asm;
pub mod disasm;
#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
pub mod harness;
pub mod host;
pub mod isa;
pub mod jit;
pub mod sandbox;
pub mod thread;
pub mod wire;

pub use asm::{ProgramBuilder, SourceError, assemble_source};
pub use disasm::{BitReader, disassemble, render_listing};
#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
pub use harness::{RunOutcome, run_image};
pub use isa::{Instruction, Op, Operand};
pub use jit::{ENTRY_OFFSET, JitError, JitResult, TranslateOptions, TranslatedProgram, translate};
pub use wire::{FileHeader, ProgramImage, WireError, decode_image};
