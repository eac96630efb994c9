use super::arm64::{self, Cond};
use super::{JitError, JitResult};
use crate::isa::Operand;

/// Native code index of the first emitted guest instruction: the prologue
/// below is exactly this many words and entry dispatch relies on it.
pub const ENTRY_OFFSET: usize = 11;

/// Branch displacement bound: a 26-bit instruction displacement covers
/// +/-128 MiB, so the code vector must stay under that.
pub const MAX_CODE_BYTES: usize = 128 * 1024 * 1024;

// Register conventions of the generated function.
const MEM_BASE: u8 = 19; // x19, sandbox memory base
const REG_BASE: u8 = 20; // x20, guest register array
const SCRATCH0: u8 = 2;
const SCRATCH1: u8 = 3;
const AUX: u8 = 4;
const HOST_PTR: u8 = 9;

/// Register-array slot holding the halt-request flag. The caller allocates
/// one slot past the 16 guest registers; host shims set it and every host
/// call is followed by a check that branches to the unwind stub.
pub const HALT_SLOT: u32 = 16;

/// Emits the generated function
/// `fn(memory_base: *mut u8, regs: *mut [u64; 16], entry: usize)` as a
/// growing vector of 32-bit words. Branch-like sites are emitted with zero
/// displacement and patched through `patch_branch_or_imm` once targets are
/// known.
pub struct JitBuilder {
    code: Vec<u32>,
    halt_checks: Vec<usize>,
}

impl Default for JitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JitBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            code: Vec::new(),
            halt_checks: Vec::new(),
        };
        builder.begin();
        builder
    }

    /// Prologue: save the frame, preserve x0/x1 in x19/x20, then dispatch to
    /// `code_base + entry * 4`. The ADR resolves to native index 0, so entry
    /// values are absolute code indices and `entry == ENTRY_OFFSET` lands on
    /// the first guest instruction.
    fn begin(&mut self) {
        self.emit(arm64::sub_x_imm(arm64::SP, arm64::SP, 16));
        self.emit(arm64::stp_x(29, 30, arm64::SP, 0));
        self.emit(arm64::add_x_imm(29, arm64::SP, 0));
        self.emit(arm64::sub_x_imm(arm64::SP, arm64::SP, 16));
        self.emit(arm64::stp_x(MEM_BASE, REG_BASE, arm64::SP, 0));
        self.emit(arm64::mov_x(MEM_BASE, 0));
        self.emit(arm64::mov_x(REG_BASE, 1));
        self.emit(arm64::lsl_x_imm(2, 2, 2));
        let adr_index = self.emit(arm64::adr(HOST_PTR, 0));
        self.code[adr_index] = arm64::adr(HOST_PTR, -((adr_index as i32) * 4));
        self.emit(arm64::add_x_reg(HOST_PTR, HOST_PTR, 2));
        self.emit(arm64::br(HOST_PTR));
        debug_assert_eq!(self.code.len(), ENTRY_OFFSET);
    }

    /// Seals the function with the unwind stub. Reached by fall-through at
    /// the top level, and from any guest call depth through the halt checks:
    /// x29 still anchors the entry frame (guest prologues push only x30), so
    /// restoring SP from it discards every guest frame in one step. All
    /// pending halt-check words are patched to branch here.
    pub fn end(&mut self) -> JitResult<()> {
        let stub = self.current_index();
        for site in std::mem::take(&mut self.halt_checks) {
            let offset = stub as i64 - site as i64;
            if !(-(1 << 18)..(1 << 18)).contains(&offset) {
                return Err(JitError::BranchOutOfRange {
                    at: site,
                    target: stub,
                });
            }
            self.code[site] = arm64::cbnz_x(AUX, offset as i32);
        }
        self.emit(arm64::sub_x_imm(arm64::SP, 29, 16));
        self.emit(arm64::ldp_x(MEM_BASE, REG_BASE, arm64::SP, 0));
        self.emit(arm64::add_x_imm(arm64::SP, arm64::SP, 16));
        self.emit(arm64::ldp_x(29, 30, arm64::SP, 0));
        self.emit(arm64::add_x_imm(arm64::SP, arm64::SP, 16));
        self.emit(arm64::ret());
        Ok(())
    }

    pub fn current_index(&self) -> usize {
        self.code.len()
    }

    pub fn code_bytes(&self) -> usize {
        self.code.len() * 4
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u32> {
        self.code
    }

    fn emit(&mut self, word: u32) -> usize {
        self.code.push(word);
        self.code.len() - 1
    }

    fn load_imm64(&mut self, reg: u8, value: u64) {
        let parts = [
            (value & 0xFFFF) as u16,
            ((value >> 16) & 0xFFFF) as u16,
            ((value >> 32) & 0xFFFF) as u16,
            ((value >> 48) & 0xFFFF) as u16,
        ];

        let Some(first) = parts.iter().position(|part| *part != 0) else {
            self.emit(arm64::movz_x(reg, 0, 0));
            return;
        };

        self.emit(arm64::movz_x(reg, parts[first], first as u32 * 16));
        for (i, part) in parts.iter().enumerate().skip(first + 1) {
            if *part != 0 {
                self.emit(arm64::movk_x(reg, *part, i as u32 * 16));
            }
        }
    }

    fn load_guest_reg(&mut self, dst: u8, index: u8) {
        // registers[index], 8-byte scaled immediate
        self.emit(arm64::ldr_x_imm(dst, REG_BASE, u32::from(index)));
    }

    fn store_guest_reg(&mut self, src: u8, index: u8) {
        self.emit(arm64::str_x_imm(src, REG_BASE, u32::from(index)));
    }

    /// Loads the low 32 bits of registers[index]; the truncation pairs with
    /// the UXTW addressing mode so a guest offset can never leave the
    /// 2^32-byte reservation.
    fn load_guest_offset(&mut self, dst: u8, index: u8) {
        self.emit(arm64::ldr_w_imm(dst, REG_BASE, u32::from(index) * 2));
    }

    fn load_operand(&mut self, dst: u8, operand: &Operand) -> JitResult<()> {
        match operand {
            Operand::Reg(index) => {
                self.load_guest_reg(dst, *index);
                Ok(())
            }
            Operand::Mem { reg, size } => {
                self.load_guest_offset(dst, *reg);
                self.emit(arm64::ldr_reg_uxtw(dst, MEM_BASE, dst, u32::from(*size) * 8));
                Ok(())
            }
            Operand::Const(value) => {
                self.load_imm64(dst, *value as u64);
                Ok(())
            }
            Operand::Addr(bits) => {
                self.load_imm64(dst, u64::from(*bits));
                Ok(())
            }
            Operand::None => Err(JitError::UnsupportedOperand {
                what: "load",
                operand: *operand,
            }),
        }
    }

    fn store_operand(&mut self, src: u8, operand: &Operand) -> JitResult<()> {
        match operand {
            Operand::Reg(index) => {
                self.store_guest_reg(src, *index);
                Ok(())
            }
            Operand::Mem { reg, size } => {
                self.load_guest_offset(SCRATCH1, *reg);
                self.emit(arm64::str_reg_uxtw(src, MEM_BASE, SCRATCH1, u32::from(*size) * 8));
                Ok(())
            }
            _ => Err(JitError::UnsupportedOperand {
                what: "store",
                operand: *operand,
            }),
        }
    }

    pub fn mov(&mut self, dst: &Operand, src: &Operand) -> JitResult<()> {
        self.load_operand(SCRATCH0, src)?;
        self.store_operand(SCRATCH0, dst)
    }

    /// Returns the index of the first emitted word so a caller may rewrite
    /// the materialized immediate later.
    pub fn load_immediate(&mut self, dst: &Operand, value: i64) -> JitResult<usize> {
        let pos = self.current_index();
        self.load_imm64(SCRATCH0, value as u64);
        self.store_operand(SCRATCH0, dst)?;
        Ok(pos)
    }

    pub fn add(&mut self, dst: &Operand, a: &Operand, b: &Operand) -> JitResult<()> {
        self.binary_op(dst, a, b, arm64::add_x_reg(SCRATCH0, SCRATCH0, SCRATCH1))
    }

    pub fn sub(&mut self, dst: &Operand, a: &Operand, b: &Operand) -> JitResult<()> {
        self.binary_op(dst, a, b, arm64::sub_x_reg(SCRATCH0, SCRATCH0, SCRATCH1))
    }

    pub fn mul(&mut self, dst: &Operand, a: &Operand, b: &Operand) -> JitResult<()> {
        self.binary_op(dst, a, b, arm64::mul_x(SCRATCH0, SCRATCH0, SCRATCH1))
    }

    /// Signed divide; division by zero yields zero per the ISA's divide
    /// semantics.
    pub fn div(&mut self, dst: &Operand, a: &Operand, b: &Operand) -> JitResult<()> {
        self.binary_op(dst, a, b, arm64::sdiv_x(SCRATCH0, SCRATCH0, SCRATCH1))
    }

    fn binary_op(&mut self, dst: &Operand, a: &Operand, b: &Operand, word: u32) -> JitResult<()> {
        self.load_operand(SCRATCH0, a)?;
        self.load_operand(SCRATCH1, b)?;
        self.emit(word);
        self.store_operand(SCRATCH0, dst)
    }

    /// Remainder via unsigned divide and multiply-subtract. The divide here
    /// is unsigned while `div` is signed; guest programs rely on the
    /// asymmetry.
    pub fn modulo(&mut self, dst: &Operand, a: &Operand, b: &Operand) -> JitResult<()> {
        self.load_operand(SCRATCH0, a)?;
        self.load_operand(SCRATCH1, b)?;
        self.emit(arm64::udiv_x(AUX, SCRATCH0, SCRATCH1));
        self.emit(arm64::msub_x(SCRATCH0, AUX, SCRATCH1, SCRATCH0));
        self.store_operand(SCRATCH0, dst)
    }

    /// dst = -1, 0 or +1 depending on the sign of src.
    pub fn signum(&mut self, dst: &Operand, src: &Operand) -> JitResult<()> {
        self.load_operand(SCRATCH0, src)?;
        self.emit(arm64::cmp_x(SCRATCH0, arm64::ZR));
        self.emit(arm64::cset_x(SCRATCH1, Cond::Gt));
        self.emit(arm64::cmp_x(SCRATCH0, arm64::ZR));
        self.emit(arm64::cset_x(AUX, Cond::Lt));
        self.emit(arm64::sub_x_reg(SCRATCH0, SCRATCH1, AUX));
        self.store_operand(SCRATCH0, dst)
    }

    /// Sets condition flags from a - b. The next emitted word must be the
    /// branch that consumes the flags; nothing in between may clobber them.
    pub fn compare(&mut self, a: &Operand, b: &Operand) -> JitResult<usize> {
        let pos = self.current_index();
        self.load_operand(SCRATCH0, a)?;
        self.load_operand(SCRATCH1, b)?;
        self.emit(arm64::cmp_x(SCRATCH0, SCRATCH1));
        Ok(pos)
    }

    pub fn branch_if_equal(&mut self) -> usize {
        self.emit(arm64::b_cond(Cond::Eq, 0))
    }

    pub fn jump(&mut self) -> usize {
        self.emit(arm64::b(0))
    }

    pub fn call(&mut self) -> usize {
        self.emit(arm64::bl(0))
    }

    pub fn ret(&mut self) {
        self.emit(arm64::ret());
    }

    pub fn nop(&mut self) {
        self.emit(arm64::nop());
    }

    /// Two-word frame push emitted at every CALL-reachable label.
    pub fn func_prologue(&mut self) {
        self.emit(arm64::sub_x_imm(arm64::SP, arm64::SP, 16));
        self.emit(arm64::str_x_imm(30, arm64::SP, 0));
    }

    /// One-word pop matching `func_prologue`.
    pub fn func_epilogue(&mut self) {
        self.emit(arm64::ldr_x_post(30, arm64::SP, 16));
    }

    /// Loads up to four operands into the argument registers, calls the host
    /// function through x9 and stores x0 into `ret` (when present). Returns
    /// the index of the first emitted word; when `ops[0]` is an `Addr` that
    /// word is the MOVZ carrying its low 16 bits, which the translator
    /// patches to a native code index for CREATETHREAD.
    pub fn host_call_with_ops(
        &mut self,
        func_ptr: u64,
        ret: &Operand,
        ops: [&Operand; 4],
    ) -> JitResult<usize> {
        let pos = self.current_index();
        for (arg_reg, operand) in ops.into_iter().enumerate() {
            match operand {
                Operand::None => {}
                Operand::Addr(bits) => {
                    // single patchable word, see patch_branch_or_imm
                    self.emit(arm64::movz_x(arg_reg as u8, (*bits & 0xFFFF) as u16, 0));
                }
                other => self.load_operand(arg_reg as u8, other)?,
            }
        }
        self.load_imm64(HOST_PTR, func_ptr);
        self.emit(arm64::blr(HOST_PTR));
        if !matches!(ret, Operand::None) {
            self.store_operand(0, ret)?;
        }
        // the shim may have requested a halt (HLT, cancelled sleep)
        self.emit(arm64::ldr_x_imm(AUX, REG_BASE, HALT_SLOT));
        let site = self.emit(arm64::cbnz_x(AUX, 0));
        self.halt_checks.push(site);
        Ok(pos)
    }

    /// Rewrites a previously emitted patch site, dispatching on the opcode
    /// bits of the existing word: a MOVZ gets its 16-bit immediate replaced,
    /// branches get their displacement rewritten relative to the patched
    /// word. Offsets are in instructions, not bytes.
    pub fn patch_branch_or_imm(&mut self, at: usize, target: usize) -> JitResult<()> {
        let Some(&word) = self.code.get(at) else {
            return Err(JitError::PatchOutOfBounds { at, len: self.code.len() });
        };

        if word & 0xFFE0_0000 == 0xD280_0000 {
            // MOVZ Xd, #imm16: the target index is handed to the host as a
            // 16-bit value, so it must fit.
            if target > 0xFFFF {
                return Err(JitError::ThreadEntryOutOfRange(target));
            }
            self.code[at] = (word & 0xFFE0_001F) | ((target as u32) << 5);
            return Ok(());
        }

        let offset = target as i64 - at as i64;
        if word & 0xFF00_0000 == 0x5400_0000 {
            if !(-(1 << 18)..(1 << 18)).contains(&offset) {
                return Err(JitError::BranchOutOfRange { at, target });
            }
            self.code[at] = (word & 0xFF00_001F) | ((((offset as i32) & 0x7FFFF) as u32) << 5);
            Ok(())
        } else if word & 0xFC00_0000 == 0x1400_0000 || word & 0xFC00_0000 == 0x9400_0000 {
            if !(-(1 << 25)..(1 << 25)).contains(&offset) {
                return Err(JitError::BranchOutOfRange { at, target });
            }
            self.code[at] = (word & 0xFC00_0000) | (((offset as i32) & 0x03FF_FFFF) as u32);
            Ok(())
        } else {
            Err(JitError::PatchSiteMismatch { at, word })
        }
    }
}
