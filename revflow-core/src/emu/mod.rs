//! Instruction-Set Emulator
//!
//! Interprets decoded ARM opcodes over a banked register file and a memory
//! image. Execution is condition-gated: an instruction whose predicate fails
//! against the CPSR flag nibble only advances the program counter. Handlers
//! return the new program counter for taken branches or `None` for
//! sequential flow.
//!
//! # Partial-Defined Emulation
//! Operands resolve to `Option` values; when a source is undefined the
//! handler writes an undefined destination and marks the flags undefined
//! instead of computing spurious values.
//!
//! # Arithmetic Core
//! [`add_with_carry`] implements the ARM pseudocode exactly; subtraction is
//! `add_with_carry(x, !y, 1)` so the carry-out doubles as a not-borrow flag.

use std::collections::HashMap;

use crate::error::{Result, RevflowError};
use crate::memory::{Endian, MemoryImage};
use crate::opcode::{
    condition_passes, decoder, IfFlags, Mnem, Opcode, Operand, OperandAccess,
};
use crate::registers::{
    RegisterContext, PM_SYS, PM_USR, PSR_C, PSR_N, PSR_T, PSR_V, PSR_Z, REG_LR, REG_PC, REG_SP,
};

pub mod coproc;

use coproc::{CoProcStub, CoProcessor};

/// Number of interrupt vectors the emulator tracks.
pub const INT_VECTORS: usize = 100;

/// Procedure-call convention record (AAPCS).
///
/// Arguments travel in r0-r3 and then on the stack; the return address lives
/// in the link register and the return value in r0.
#[derive(Debug, Clone, Copy)]
pub struct CallingConvention {
    pub arg_regs: &'static [u32],
    pub retaddr_reg: u32,
    pub retval_reg: u32,
    pub stack_align: u32,
}

/// The ARM architecture procedure-call standard.
pub const AAPCS: CallingConvention = CallingConvention {
    arg_regs: &[0, 1, 2, 3],
    retaddr_reg: REG_LR,
    retval_reg: 0,
    stack_align: 8,
};

/// ARM `AddWithCarry` from the architecture pseudocode.
///
/// Returns `(result, carry_out, overflow)`. When called as
/// `add_with_carry(x, !y, 1)` the triple describes `x - y` with carry-out
/// acting as the not-borrow flag.
#[inline]
pub fn add_with_carry(x: u32, y: u32, carry_in: u32) -> (u32, bool, bool) {
    let unsigned_sum = x as u64 + y as u64 + carry_in as u64;
    let signed_sum = x as i32 as i64 + y as i32 as i64 + carry_in as i64;
    let result = unsigned_sum as u32;
    let carry = unsigned_sum != result as u64;
    let overflow = signed_sum != result as i32 as i64;
    (result, carry, overflow)
}

type IntHandler = Box<dyn FnMut(&mut ArmEmulator, u32) -> Result<()>>;

/// ARM interpreter over a register context and a memory image.
pub struct ArmEmulator {
    regs: RegisterContext,
    mem: MemoryImage,
    coprocs: [Box<dyn CoProcessor>; 16],
    int_handlers: Vec<Option<IntHandler>>,
    meta: HashMap<String, u64>,
}

impl OperandAccess for ArmEmulator {
    fn get_reg(&self, index: u32) -> Option<u64> {
        self.regs.get(index, None)
    }

    fn set_reg(&mut self, index: u32, value: Option<u64>) {
        self.regs.set(index, value, None);
    }

    fn read_value(&mut self, va: u64, size: usize) -> Result<u64> {
        self.mem
            .read_uint(va, size)
            .ok_or(RevflowError::UnmappedMemory { va, size })
    }

    fn write_value(&mut self, va: u64, value: u64, size: usize) -> Result<()> {
        self.mem.write_uint(va, value, size)
    }
}

impl ArmEmulator {
    pub fn new(mem: MemoryImage) -> Self {
        Self {
            regs: RegisterContext::arm(),
            mem,
            coprocs: std::array::from_fn(|i| Box::new(CoProcStub::new(i as u8)) as Box<dyn CoProcessor>),
            int_handlers: (0..INT_VECTORS).map(|_| None).collect(),
            meta: HashMap::new(),
        }
    }

    pub fn regs(&self) -> &RegisterContext {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut RegisterContext {
        &mut self.regs
    }

    pub fn mem(&self) -> &MemoryImage {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut MemoryImage {
        &mut self.mem
    }

    pub fn endian(&self) -> Endian {
        self.mem.endian()
    }

    /// Current program counter.
    ///
    /// # Errors
    /// `UndefinedRegister` when a previous partial-defined operation left the
    /// pc undefined.
    pub fn pc(&self) -> Result<u64> {
        self.regs
            .get(REG_PC, None)
            .ok_or(RevflowError::UndefinedRegister(REG_PC))
    }

    pub fn set_pc(&mut self, va: u64) {
        self.regs.set(REG_PC, Some(va), None);
    }

    /// Stack counter (sp) for the current mode.
    pub fn stack_counter(&self) -> Result<u64> {
        self.regs
            .get(REG_SP, None)
            .ok_or(RevflowError::UndefinedRegister(REG_SP))
    }

    pub fn set_meta(&mut self, key: &str, value: u64) {
        self.meta.insert(key.to_string(), value);
    }

    pub fn get_meta(&self, key: &str) -> Option<u64> {
        self.meta.get(key).copied()
    }

    /// Install a real coprocessor into one of the sixteen slots.
    pub fn set_coprocessor(&mut self, idx: u8, cp: Box<dyn CoProcessor>) -> Result<()> {
        if idx > 15 {
            return Err(RevflowError::InvalidCoprocessor(idx));
        }
        self.coprocs[idx as usize] = cp;
        Ok(())
    }

    /// Bind a software-interrupt vector. Unbound vectors fall back to the
    /// default handler, which dumps the top of the stack and continues.
    pub fn set_interrupt_handler(&mut self, vector: usize, handler: IntHandler) {
        if vector < self.int_handlers.len() {
            self.int_handlers[vector] = Some(handler);
        }
    }

    /// Fetch, decode and execute the instruction at pc.
    pub fn step(&mut self) -> Result<()> {
        let pc = self.pc()?;
        let word = self
            .mem
            .read_u32(pc)
            .ok_or(RevflowError::UnmappedMemory { va: pc, size: 4 })?;
        let op = decoder::parse_opcode(pc, word)?;
        self.execute_opcode(&op)
    }

    /// Execute one decoded opcode, updating the program counter.
    pub fn execute_opcode(&mut self, op: &Opcode) -> Result<()> {
        if op.is_conditional() {
            let nzcv = self.regs.flags_nibble()?;
            if !condition_passes(op.prefixes, nzcv) {
                self.set_pc(op.next_va());
                return Ok(());
            }
        }

        let newpc = self.dispatch(op)?;
        self.set_pc(newpc.unwrap_or_else(|| op.next_va()));
        Ok(())
    }

    fn dispatch(&mut self, op: &Opcode) -> Result<Option<u64>> {
        match op.mnem {
            Mnem::And => self.i_logical(op, |a, b| a & b),
            Mnem::Orr => self.i_logical(op, |a, b| a | b),
            Mnem::Eor => self.i_logical(op, |a, b| a ^ b),
            Mnem::Bic => self.i_logical(op, |a, b| a & !b),
            Mnem::Add => self.i_add(op),
            Mnem::Adc => self.i_adc(op),
            Mnem::Sub => self.i_sub(op),
            Mnem::Sbc => self.i_sbc(op),
            Mnem::Rsb => self.i_rsb(op),
            Mnem::Rsc => self.i_rsc(op),
            Mnem::Cmp => self.i_cmp(op),
            Mnem::Cmn => self.i_cmn(op),
            Mnem::Tst => self.i_tst(op, |a, b| a & b),
            Mnem::Teq => self.i_tst(op, |a, b| a ^ b),
            Mnem::Mov => self.i_mov(op),
            Mnem::Movt => self.i_movt(op),
            Mnem::Mvn => self.i_mvn(op),
            Mnem::Mul => self.i_mul(op),
            Mnem::B => self.i_b(op),
            Mnem::Bl => self.i_bl(op),
            Mnem::Bx => self.i_bx(op, false),
            Mnem::Blx => self.i_bx(op, true),
            Mnem::Cbz => self.i_cbz(op, false),
            Mnem::Cbnz => self.i_cbz(op, true),
            Mnem::Ldr | Mnem::Ldrb => self.i_ldr(op),
            Mnem::Str | Mnem::Strb => self.i_str(op),
            Mnem::Ldm | Mnem::Pop => self.i_ldm(op),
            Mnem::Stm | Mnem::Push => self.i_stm(op),
            Mnem::Swi => self.i_swi(op),
            Mnem::Stc => self.i_coproc(op, |c, a| CoProcessor::stc(c, a)),
            Mnem::Ldc => self.i_coproc(op, |c, a| CoProcessor::ldc(c, a)),
            Mnem::Cdp => self.i_coproc(op, |c, a| CoProcessor::cdp(c, a)),
            Mnem::Mrc => self.i_coproc(op, |c, a| CoProcessor::mrc(c, a)),
            Mnem::Mrrc => self.i_coproc(op, |c, a| CoProcessor::mrrc(c, a)),
            // route mcr to the mcr entry point
            Mnem::Mcr => self.i_coproc(op, |c, a| CoProcessor::mcr(c, a)),
            Mnem::Mcrr => self.i_coproc(op, |c, a| CoProcessor::mcrr(c, a)),
        }
    }

    // ------------------------------------------------------------------
    // shared helpers

    fn oper_value(&mut self, op: &Opcode, idx: usize) -> Result<Option<u64>> {
        let oper = *op
            .opers
            .get(idx)
            .ok_or(RevflowError::BadOperand { va: op.va, oper: idx })?;
        oper.value(self)
    }

    fn set_oper(&mut self, op: &Opcode, idx: usize, value: Option<u64>) -> Result<()> {
        let oper = *op
            .opers
            .get(idx)
            .ok_or(RevflowError::BadOperand { va: op.va, oper: idx })?;
        oper.set_value(self, value)
    }

    /// Source pair for a binary operation; two-operand encodings reuse the
    /// destination as the first source.
    fn binary_sources(&mut self, op: &Opcode) -> Result<(Option<u64>, Option<u64>)> {
        let n = op.opers.len();
        if n < 2 {
            return Err(RevflowError::BadOperand { va: op.va, oper: n });
        }
        let a = self.oper_value(op, n - 2)?;
        let b = self.oper_value(op, n - 1)?;
        Ok((a, b))
    }

    fn dest_reg(op: &Opcode) -> Option<u32> {
        match op.opers.first() {
            Some(Operand::Reg(reg)) => Some(*reg),
            _ => None,
        }
    }

    /// Mark the flags undefined after a partial-defined operation.
    pub fn undef_flags(&mut self) {
        self.regs.undef_cpsr();
    }

    /// Update all four of N/Z/C/V in one CPSR write.
    fn set_nzcv(&mut self, n: bool, z: bool, c: bool, v: bool) {
        let mut nibble = 0u32;
        if n {
            nibble |= PSR_N;
        }
        if z {
            nibble |= PSR_Z;
        }
        if c {
            nibble |= PSR_C;
        }
        if v {
            nibble |= PSR_V;
        }
        self.regs.set_cpsr(nibble, PSR_N | PSR_Z | PSR_C | PSR_V);
    }

    /// Restore the CPSR from the current mode's SPSR (exception return).
    ///
    /// # Errors
    /// `ExceptionReturn` in user/system mode, which have no SPSR.
    fn exception_return(&mut self, va: u64) -> Result<()> {
        let mode = self.regs.proc_mode()?;
        if mode == PM_USR || mode == PM_SYS {
            return Err(RevflowError::ExceptionReturn { va });
        }
        let spsr = self.regs.spsr(mode).ok_or(RevflowError::UndefinedFlag)?;
        self.regs.set_cpsr(spsr, 0xffff_ffff);
        Ok(())
    }

    /// Flag-setting epilogue for the arithmetic handlers. A flag-setting
    /// write to r15 restores the CPSR from the SPSR instead of touching
    /// N/Z/C/V.
    fn arith_flags(&mut self, op: &Opcode, res: u32, carry: bool, overflow: bool) -> Result<()> {
        if !op.iflags.contains(IfFlags::PSR_S) {
            return Ok(());
        }
        if Self::dest_reg(op) == Some(REG_PC) {
            return self.exception_return(op.va);
        }
        self.set_nzcv((res as i32) < 0, res == 0, carry, overflow);
        Ok(())
    }

    /// Common arithmetic path: compute through `add_with_carry`, store,
    /// update flags, and branch when the destination is the pc.
    fn arith_op(&mut self, op: &Opcode, x: u32, y: u32, carry_in: u32) -> Result<Option<u64>> {
        let (res, carry, overflow) = add_with_carry(x, y, carry_in);
        self.set_oper(op, 0, Some(res as u64))?;
        self.arith_flags(op, res, carry, overflow)?;
        if Self::dest_reg(op) == Some(REG_PC) {
            return Ok(Some(res as u64));
        }
        Ok(None)
    }

    /// PDE epilogue: both destination and flags become undefined.
    fn undef_result(&mut self, op: &Opcode) -> Result<Option<u64>> {
        self.undef_flags();
        self.set_oper(op, 0, None)?;
        Ok(None)
    }

    // ------------------------------------------------------------------
    // data processing

    fn i_logical(&mut self, op: &Opcode, f: fn(u32, u32) -> u32) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        let res = f(a as u32, b as u32);
        self.set_oper(op, 0, Some(res as u64))?;
        if op.iflags.contains(IfFlags::PSR_S) {
            if Self::dest_reg(op) == Some(REG_PC) {
                self.exception_return(op.va)?;
            } else {
                let carry = self.regs.get_flag(PSR_C)?;
                let overflow = self.regs.get_flag(PSR_V)?;
                self.set_nzcv((res as i32) < 0, res == 0, carry, overflow);
            }
        }
        if Self::dest_reg(op) == Some(REG_PC) {
            return Ok(Some(res as u64));
        }
        Ok(None)
    }

    fn i_add(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        self.arith_op(op, a as u32, b as u32, 0)
    }

    fn i_adc(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let carry = self.regs.get_flag(PSR_C)? as u32;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        self.arith_op(op, a as u32, b as u32, carry)
    }

    fn i_sub(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        self.arith_op(op, a as u32, !(b as u32), 1)
    }

    fn i_sbc(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let carry = self.regs.get_flag(PSR_C)? as u32;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        self.arith_op(op, a as u32, !(b as u32), carry)
    }

    fn i_rsb(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        // reversed subtract: dest = src2 - src1
        self.arith_op(op, b as u32, !(a as u32), 1)
    }

    fn i_rsc(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let carry = self.regs.get_flag(PSR_C)? as u32;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        self.arith_op(op, b as u32, !(a as u32), carry)
    }

    fn i_cmp(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let a = self.oper_value(op, 0)?;
        let b = self.oper_value(op, 1)?;
        let (Some(a), Some(b)) = (a, b) else {
            self.undef_flags();
            return Ok(None);
        };
        let (res, carry, overflow) = add_with_carry(a as u32, !(b as u32), 1);
        self.set_nzcv((res as i32) < 0, res == 0, carry, overflow);
        Ok(None)
    }

    fn i_cmn(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let a = self.oper_value(op, 0)?;
        let b = self.oper_value(op, 1)?;
        let (Some(a), Some(b)) = (a, b) else {
            self.undef_flags();
            return Ok(None);
        };
        let (res, carry, overflow) = add_with_carry(a as u32, b as u32, 0);
        self.set_nzcv((res as i32) < 0, res == 0, carry, overflow);
        Ok(None)
    }

    fn i_tst(&mut self, op: &Opcode, f: fn(u32, u32) -> u32) -> Result<Option<u64>> {
        let a = self.oper_value(op, 0)?;
        let b = self.oper_value(op, 1)?;
        let (Some(a), Some(b)) = (a, b) else {
            self.undef_flags();
            return Ok(None);
        };
        let res = f(a as u32, b as u32);
        let carry = self.regs.get_flag(PSR_C)?;
        let overflow = self.regs.get_flag(PSR_V)?;
        self.set_nzcv((res as i32) < 0, res == 0, carry, overflow);
        Ok(None)
    }

    fn i_mov(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let val = self.oper_value(op, 1)?;
        let Some(val) = val else {
            return self.undef_result(op);
        };
        let val = val as u32;
        self.set_oper(op, 0, Some(val as u64))?;
        if op.iflags.contains(IfFlags::PSR_S) {
            if Self::dest_reg(op) == Some(REG_PC) {
                self.exception_return(op.va)?;
            } else {
                let carry = self.regs.get_flag(PSR_C)?;
                let overflow = self.regs.get_flag(PSR_V)?;
                self.set_nzcv((val as i32) < 0, val == 0, carry, overflow);
            }
        }
        if Self::dest_reg(op) == Some(REG_PC) {
            return Ok(Some(val as u64));
        }
        Ok(None)
    }

    fn i_movt(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let val = self.oper_value(op, 1)?;
        let cur = self.oper_value(op, 0)?;
        let (Some(val), Some(cur)) = (val, cur) else {
            return self.undef_result(op);
        };
        let res = (cur as u32 & 0xffff) | ((val as u32) << 16);
        self.set_oper(op, 0, Some(res as u64))?;
        Ok(None)
    }

    fn i_mvn(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let val = self.oper_value(op, 1)?;
        let Some(val) = val else {
            return self.undef_result(op);
        };
        self.set_oper(op, 0, Some((!(val as u32)) as u64))?;
        Ok(None)
    }

    fn i_mul(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (a, b) = self.binary_sources(op)?;
        let (Some(a), Some(b)) = (a, b) else {
            return self.undef_result(op);
        };
        let res = (a as u32).wrapping_mul(b as u32);
        self.set_oper(op, 0, Some(res as u64))?;
        if op.iflags.contains(IfFlags::PSR_S) {
            let carry = self.regs.get_flag(PSR_C)?;
            let overflow = self.regs.get_flag(PSR_V)?;
            self.set_nzcv((res as i32) < 0, res == 0, carry, overflow);
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // branches

    fn i_b(&mut self, op: &Opcode) -> Result<Option<u64>> {
        self.oper_value(op, 0)
    }

    fn i_bl(&mut self, op: &Opcode) -> Result<Option<u64>> {
        self.regs.set(REG_LR, Some(op.next_va()), None);
        self.oper_value(op, 0)
    }

    fn i_bx(&mut self, op: &Opcode, link: bool) -> Result<Option<u64>> {
        if link {
            self.regs.set(REG_LR, Some(op.next_va()), None);
        }
        let target = self
            .oper_value(op, 0)?
            .ok_or(RevflowError::UndefinedRegister(REG_PC))?;
        self.regs.set_flag(PSR_T, target & 1 != 0);
        Ok(Some(target))
    }

    fn i_cbz(&mut self, op: &Opcode, branch_if_set: bool) -> Result<Option<u64>> {
        let regval = self
            .oper_value(op, 0)?
            .ok_or(RevflowError::UndefinedRegister(REG_PC))?;
        let target = self.oper_value(op, 1)?;
        if (regval != 0) == branch_if_set {
            return Ok(target);
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // memory transfers

    /// Base-register update for pre/post-indexed addressing.
    fn apply_writeback(&mut self, op: &Opcode, idx: usize) -> Result<()> {
        let Some(Operand::Mem {
            base,
            offset,
            index,
            shift,
            shift_amount,
            writeback: true,
            ..
        }) = op.opers.get(idx).copied()
        else {
            return Ok(());
        };
        let Some(base_val) = self.regs.get(base, None) else {
            return Ok(());
        };
        let new_base = match index {
            Some(ridx) => match self.regs.get(ridx, None) {
                Some(iv) => (base_val as u32).wrapping_add(shift.apply(iv as u32, shift_amount)),
                None => return Ok(()),
            },
            None => (base_val as u32).wrapping_add(offset as u32),
        };
        self.regs.set(base, Some(new_base as u64), None);
        Ok(())
    }

    fn i_ldr(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let val = self.oper_value(op, 1)?;
        self.apply_writeback(op, 1)?;
        self.set_oper(op, 0, val)?;
        if Self::dest_reg(op) == Some(REG_PC) {
            return Ok(val);
        }
        Ok(None)
    }

    fn i_str(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let val = self.oper_value(op, 0)?;
        self.set_oper(op, 1, val)?;
        self.apply_writeback(op, 1)?;
        Ok(None)
    }

    /// Base register and transfer mask for ldm/stm/push/pop shapes.
    fn multi_shape(&self, op: &Opcode) -> Result<(u32, u16)> {
        match op.opers.as_slice() {
            [Operand::Reg(base), Operand::RegList(mask)] => Ok((*base, *mask)),
            [Operand::RegList(mask)] => Ok((REG_SP, *mask)),
            _ => Err(RevflowError::BadOperand { va: op.va, oper: 0 }),
        }
    }

    fn i_ldm(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (base, mask) = self.multi_shape(op)?;
        let mut addr = self
            .regs
            .get(base, None)
            .ok_or(RevflowError::UndefinedRegister(base))?;
        let increment = op.iflags.contains(IfFlags::DAIB_I);
        let before = op.iflags.contains(IfFlags::DAIB_B);
        let mut newpc = None;

        let order: Box<dyn Iterator<Item = u32>> = if increment {
            Box::new(0..16)
        } else {
            Box::new((0..16).rev())
        };
        for reg in order {
            if mask & (1 << reg) == 0 {
                continue;
            }
            if before {
                addr = if increment { addr.wrapping_add(4) } else { addr.wrapping_sub(4) };
            }
            let val = self.read_value(addr, 4)?;
            self.regs.set(reg, Some(val), None);
            if reg == REG_PC {
                newpc = Some(val);
            }
            if !before {
                addr = if increment { addr.wrapping_add(4) } else { addr.wrapping_sub(4) };
            }
        }

        if op.iflags.contains(IfFlags::WRITEBACK) {
            self.regs.set(base, Some(addr), None);
        }
        Ok(newpc)
    }

    fn i_stm(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let (base, mask) = self.multi_shape(op)?;
        let mut addr = self
            .regs
            .get(base, None)
            .ok_or(RevflowError::UndefinedRegister(base))?;
        let increment = op.iflags.contains(IfFlags::DAIB_I);
        let before = op.iflags.contains(IfFlags::DAIB_B);

        let order: Box<dyn Iterator<Item = u32>> = if increment {
            Box::new(0..16)
        } else {
            Box::new((0..16).rev())
        };
        for reg in order {
            if mask & (1 << reg) == 0 {
                continue;
            }
            if before {
                addr = if increment { addr.wrapping_add(4) } else { addr.wrapping_sub(4) };
            }
            match self.regs.get(reg, None) {
                Some(val) => self.write_value(addr, val, 4)?,
                None => log::debug!("stm: skipping store of undefined r{}", reg),
            }
            if !before {
                addr = if increment { addr.wrapping_add(4) } else { addr.wrapping_sub(4) };
            }
        }

        if op.iflags.contains(IfFlags::WRITEBACK) {
            self.regs.set(base, Some(addr), None);
        }
        Ok(None)
    }

    /// Push one word onto the stack.
    pub fn push_word(&mut self, val: u64) -> Result<()> {
        let sp = self.stack_counter()? - 4;
        self.write_value(sp, val, 4)?;
        self.regs.set(REG_SP, Some(sp), None);
        Ok(())
    }

    /// Pop one word off the stack.
    pub fn pop_word(&mut self) -> Result<u64> {
        let sp = self.stack_counter()?;
        let val = self.read_value(sp, 4)?;
        self.regs.set(REG_SP, Some(sp + 4), None);
        Ok(val)
    }

    // ------------------------------------------------------------------
    // interrupts and coprocessors

    fn i_swi(&mut self, op: &Opcode) -> Result<Option<u64>> {
        let vector = self
            .oper_value(op, 0)?
            .ok_or(RevflowError::BadOperand { va: op.va, oper: 0 })?;
        self.interrupt(vector as u32)?;
        Ok(None)
    }

    /// Invoke an interrupt vector.
    pub fn interrupt(&mut self, vector: u32) -> Result<()> {
        let slot = vector as usize;
        if slot >= self.int_handlers.len() {
            log::warn!("interrupt vector 0x{:x} beyond the vector table", vector);
            return self.default_int_handler(vector);
        }
        match self.int_handlers[slot].take() {
            Some(mut handler) => {
                let res = handler(self, vector);
                self.int_handlers[slot] = Some(handler);
                res
            }
            None => self.default_int_handler(vector),
        }
    }

    /// Unbound vectors dump the top of the stack and continue.
    fn default_int_handler(&mut self, vector: u32) -> Result<()> {
        let pc = self.pc().unwrap_or(0);
        log::warn!("unhandled interrupt {} at 0x{:08x}", vector, pc);
        if let Ok(mut sp) = self.stack_counter() {
            for _ in 0..16 {
                match self.mem.read_u32(sp) {
                    Some(word) => log::debug!("  0x{:08x}: 0x{:08x}", sp, word),
                    None => break,
                }
                sp += self.mem.pointer_size() as u64;
            }
        }
        Ok(())
    }

    fn i_coproc(
        &mut self,
        op: &Opcode,
        entry: fn(&mut dyn CoProcessor, &[Operand]) -> Result<()>,
    ) -> Result<Option<u64>> {
        let cpnum = match op.opers.first() {
            Some(Operand::Imm(val)) => *val,
            _ => return Err(RevflowError::BadOperand { va: op.va, oper: 0 }),
        };
        if cpnum > 15 {
            return Err(RevflowError::InvalidCoprocessor(cpnum as u8));
        }
        entry(self.coprocs[cpnum as usize].as_mut(), &op.opers)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Perm;
    use crate::opcode::COND_AL;

    fn emu() -> ArmEmulator {
        let mut mem = MemoryImage::new(4, Endian::Little);
        mem.add_map(0x1000, 0x1000, Perm::READ | Perm::EXEC, "text", vec![0; 0x1000])
            .unwrap();
        mem.add_map(0x8000, 0x2000, Perm::READ | Perm::WRITE, "stack", vec![0; 0x2000])
            .unwrap();
        ArmEmulator::new(mem)
    }

    fn alu(mnem: Mnem, sflag: bool, rd: u32, rn: u32, oper2: Operand) -> Opcode {
        let iflags = if sflag { IfFlags::PSR_S } else { IfFlags::empty() };
        Opcode::new(
            0x1000,
            4,
            mnem,
            COND_AL,
            iflags,
            &[Operand::Reg(rd), Operand::Reg(rn), oper2],
        )
    }

    #[test]
    fn add_with_carry_matches_pseudocode() {
        assert_eq!(add_with_carry(1, 2, 0), (3, false, false));
        assert_eq!(add_with_carry(0xffff_ffff, 1, 0), (0, true, false));
        assert_eq!(add_with_carry(0x7fff_ffff, 1, 0), (0x8000_0000, false, true));
        // subtraction form: 5 - 3
        assert_eq!(add_with_carry(5, !3u32, 1), (2, true, false));
    }

    #[test]
    fn failed_condition_only_advances_pc() {
        let mut emu = emu();
        emu.regs_mut().set_cpsr(0, 0xffff_ffff); // Z clear
        emu.regs_mut().set(1, Some(7), None);
        // addeq r1, r1, r1
        let op = Opcode::new(
            0x1000,
            4,
            Mnem::Add,
            0,
            IfFlags::empty(),
            &[Operand::Reg(1), Operand::Reg(1), Operand::Reg(1)],
        );
        emu.execute_opcode(&op).unwrap();
        assert_eq!(emu.regs().get(1, None), Some(7));
        assert_eq!(emu.pc().unwrap(), 0x1004);
    }

    #[test]
    fn logical_flags_do_not_touch_carry() {
        let mut emu = emu();
        emu.regs_mut().set_cpsr(PSR_C, 0xffff_ffff);
        emu.regs_mut().set(1, Some(0xf0f0_f0f0), None);
        emu.regs_mut().set(2, Some(0x0f0f_0f0f), None);
        let op = alu(Mnem::And, true, 0, 1, Operand::Reg(2));
        emu.execute_opcode(&op).unwrap();
        assert_eq!(emu.regs().get(0, None), Some(0));
        assert!(emu.regs().get_flag(PSR_Z).unwrap());
        assert!(emu.regs().get_flag(PSR_C).unwrap());
    }

    #[test]
    fn undefined_source_poisons_dest_and_flags() {
        let mut emu = emu();
        emu.regs_mut().set(1, None, None);
        emu.regs_mut().set(2, Some(5), None);
        let op = alu(Mnem::Add, true, 0, 1, Operand::Reg(2));
        // executing an unconditional opcode with undefined sources succeeds
        let newpc = emu.dispatch(&op).unwrap();
        assert_eq!(newpc, None);
        assert_eq!(emu.regs().get(0, None), None);
        assert_eq!(emu.regs().get_flag(PSR_Z), Err(RevflowError::UndefinedFlag));
    }

    #[test]
    fn bx_sets_thumb_bit() {
        let mut emu = emu();
        emu.regs_mut().set(REG_LR, Some(0x2001), None);
        let op = Opcode::new(
            0x1000,
            4,
            Mnem::Bx,
            COND_AL,
            IfFlags::empty(),
            &[Operand::Reg(REG_LR)],
        );
        emu.execute_opcode(&op).unwrap();
        assert!(emu.regs().get_flag(PSR_T).unwrap());
        assert_eq!(emu.pc().unwrap(), 0x2001);
    }

    #[test]
    fn push_pop_round_trip() {
        let mut emu = emu();
        emu.regs_mut().set(REG_SP, Some(0x9000), None);
        emu.regs_mut().set(4, Some(0x1111), None);
        emu.regs_mut().set(REG_LR, Some(0x2222), None);

        emu.execute_opcode(&Opcode::push(0x1000, (1 << 4) | (1 << REG_LR)))
            .unwrap();
        assert_eq!(emu.stack_counter().unwrap(), 0x8FF8);
        assert_eq!(emu.mem().read_u32(0x8FF8), Some(0x1111));
        assert_eq!(emu.mem().read_u32(0x8FFC), Some(0x2222));

        emu.regs_mut().set(4, Some(0), None);
        emu.execute_opcode(&Opcode::pop(0x1004, (1 << 4) | (1 << REG_PC)))
            .unwrap();
        assert_eq!(emu.regs().get(4, None), Some(0x1111));
        assert_eq!(emu.pc().unwrap(), 0x2222);
        assert_eq!(emu.stack_counter().unwrap(), 0x9000);
    }

    #[test]
    fn invalid_coprocessor_is_fatal() {
        let mut emu = emu();
        let op = Opcode::new(
            0x1000,
            4,
            Mnem::Cdp,
            COND_AL,
            IfFlags::empty(),
            &[Operand::Imm(16)],
        );
        assert_eq!(
            emu.execute_opcode(&op),
            Err(RevflowError::InvalidCoprocessor(16))
        );
    }

    #[test]
    fn unbound_interrupt_continues() {
        let mut emu = emu();
        emu.regs_mut().set(REG_SP, Some(0x9000), None);
        let op = Opcode::new(
            0x1000,
            4,
            Mnem::Swi,
            COND_AL,
            IfFlags::empty(),
            &[Operand::Imm(7)],
        );
        emu.execute_opcode(&op).unwrap();
        assert_eq!(emu.pc().unwrap(), 0x1004);
    }

    #[test]
    fn bound_interrupt_handler_runs() {
        let mut emu = emu();
        emu.set_interrupt_handler(
            7,
            Box::new(|emu, vector| {
                emu.set_meta("last_swi", vector as u64);
                Ok(())
            }),
        );
        emu.interrupt(7).unwrap();
        assert_eq!(emu.get_meta("last_swi"), Some(7));
    }

    #[test]
    fn aapcs_shape() {
        assert_eq!(AAPCS.arg_regs, &[0, 1, 2, 3]);
        assert_eq!(AAPCS.retaddr_reg, REG_LR);
        assert_eq!(AAPCS.retval_reg, 0);
    }
}
