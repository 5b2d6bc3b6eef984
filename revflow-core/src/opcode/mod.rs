//! Opcode Model
//!
//! Decoded instruction and operand objects shared by the code-flow analyzer
//! and the emulator. The decoder (see [`decoder`]) produces [`Opcode`] values;
//! everything downstream works from this shape alone, so other architectures
//! can plug in by producing the same objects.
//!
//! # Branch Metadata
//! [`Opcode::branches`] yields `(target, flags)` pairs describing every way
//! control can leave the instruction. A `None` target is an indirect branch
//! the decoder could not resolve; the code-flow analyzer hands those to its
//! dynamic-branch resolvers.

use bitflags::bitflags;
use smallvec::{smallvec, SmallVec};
use std::fmt;

use crate::error::Result;
use crate::registers::{REG_PC, REG_SP};

pub mod decoder;

/// Instruction-set architecture selector for `parse_opcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Arch {
    #[default]
    Arm = 0,
}

bitflags! {
    /// Branch kinds attached to a `(target, flags)` pair.
    ///
    /// The kinds are disjoint: a procedural call is PROC, a conditional edge
    /// is COND, linear flow is FALL, a pointer-indirected target is DEREF and
    /// a switch-style pointer array is TABLE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BranchFlags: u16 {
        const PROC = 1;
        const COND = 2;
        const FALL = 4;
        const DEREF = 8;
        const TABLE = 16;
    }
}

bitflags! {
    /// Instruction-level flags.
    ///
    /// `PSR_S` marks flag-setting variants. `DAIB_I`/`DAIB_B` carry the
    /// increment/decrement and before/after indexing of multi-register
    /// transfers: I set = increment, clear = decrement; B set = adjust the
    /// address before each access, clear = after.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfFlags: u32 {
        const PSR_S = 1;
        const DAIB_I = 2;
        const DAIB_B = 4;
        /// Multi-register transfer updates its base register.
        const WRITEBACK = 8;
    }
}

/// Barrel-shifter operation applied to a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
    Ror = 3,
}

impl Shift {
    /// Apply the shift to a 32-bit value.
    #[inline]
    pub fn apply(&self, value: u32, amount: u8) -> u32 {
        let amount = amount as u32;
        if amount == 0 {
            return value;
        }
        match self {
            Shift::Lsl => value.wrapping_shl(amount),
            Shift::Lsr => value.wrapping_shr(amount),
            Shift::Asr => (value as i32).wrapping_shr(amount) as u32,
            Shift::Ror => value.rotate_right(amount),
        }
    }
}

/// Register/memory access surface operands need from the emulator.
///
/// The emulator implements this; operands stay decoupled from its concrete
/// type so tests can drive them with simple fakes.
pub trait OperandAccess {
    /// Current value of a (possibly meta) register index, `None` when the
    /// register is undefined.
    fn get_reg(&self, index: u32) -> Option<u64>;

    /// Set a (possibly meta) register; `None` marks it undefined.
    fn set_reg(&mut self, index: u32, value: Option<u64>);

    /// Read an unsigned `size`-byte value at `va`.
    fn read_value(&mut self, va: u64, size: usize) -> Result<u64>;

    /// Write an unsigned `size`-byte value at `va`.
    fn write_value(&mut self, va: u64, value: u64, size: usize) -> Result<()>;
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Plain register reference (index may be a packed meta-register).
    Reg(u32),
    /// Register shifted by an immediate through the barrel shifter.
    ShiftedReg { reg: u32, shift: Shift, amount: u8 },
    /// Discrete immediate value (branch targets are stored absolute).
    Imm(u64),
    /// Memory reference `[base, offset/index]`.
    Mem {
        base: u32,
        offset: i32,
        index: Option<u32>,
        shift: Shift,
        shift_amount: u8,
        size: u8,
        writeback: bool,
        post: bool,
    },
    /// Multi-register transfer list as a 16-bit mask (bit N = rN).
    RegList(u16),
}

impl Operand {
    /// Plain word-sized memory operand with an immediate offset.
    pub fn mem(base: u32, offset: i32) -> Self {
        Operand::Mem {
            base,
            offset,
            index: None,
            shift: Shift::Lsl,
            shift_amount: 0,
            size: 4,
            writeback: false,
            post: false,
        }
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg(_) | Operand::ShiftedReg { .. })
    }

    pub fn is_immed(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    pub fn is_deref(&self) -> bool {
        matches!(self, Operand::Mem { .. })
    }

    /// True when the operand's value is knowable without an emulator.
    pub fn is_discrete(&self) -> bool {
        self.is_immed()
    }

    /// Effective address of a memory operand, `None` when a participating
    /// register is undefined.
    pub fn address<E: OperandAccess>(&self, emu: &E) -> Option<u64> {
        match *self {
            Operand::Mem {
                base,
                offset,
                index,
                shift,
                shift_amount,
                post,
                ..
            } => {
                let base_val = emu.get_reg(base)? as u32;
                if post {
                    return Some(base_val as u64);
                }
                let ea = match index {
                    Some(idx) => {
                        let idx_val = emu.get_reg(idx)? as u32;
                        base_val.wrapping_add(shift.apply(idx_val, shift_amount))
                    }
                    None => base_val.wrapping_add(offset as u32),
                };
                Some(ea as u64)
            }
            _ => None,
        }
    }

    /// Fetch the operand's value through the emulator. `Ok(None)` means the
    /// value is undefined (partial-defined emulation).
    pub fn value<E: OperandAccess>(&self, emu: &mut E) -> Result<Option<u64>> {
        match *self {
            Operand::Reg(reg) => Ok(emu.get_reg(reg)),
            Operand::ShiftedReg { reg, shift, amount } => {
                Ok(emu.get_reg(reg).map(|v| shift.apply(v as u32, amount) as u64))
            }
            Operand::Imm(val) => Ok(Some(val)),
            Operand::Mem { size, .. } => match self.address(emu) {
                Some(ea) => emu.read_value(ea, size as usize).map(Some),
                None => Ok(None),
            },
            Operand::RegList(_) => Ok(None),
        }
    }

    /// Store a value through the operand. Undefined values propagate to
    /// register destinations; a memory store of an undefined value is
    /// skipped.
    pub fn set_value<E: OperandAccess>(&self, emu: &mut E, value: Option<u64>) -> Result<()> {
        match *self {
            Operand::Reg(reg) => {
                emu.set_reg(reg, value);
                Ok(())
            }
            Operand::Mem { size, .. } => {
                let Some(val) = value else {
                    log::debug!("skipping store of undefined value");
                    return Ok(());
                };
                match self.address(emu) {
                    Some(ea) => emu.write_value(ea, val, size as usize),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Instruction mnemonics known to the decoder and the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mnem {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Movt,
    Bic,
    Mvn,
    Mul,
    B,
    Bl,
    Bx,
    Blx,
    Cbz,
    Cbnz,
    Ldr,
    Ldrb,
    Str,
    Strb,
    Ldm,
    Stm,
    Push,
    Pop,
    Swi,
    Stc,
    Ldc,
    Cdp,
    Mrc,
    Mrrc,
    Mcr,
    Mcrr,
}

impl Mnem {
    pub fn name(&self) -> &'static str {
        match self {
            Mnem::And => "and",
            Mnem::Eor => "eor",
            Mnem::Sub => "sub",
            Mnem::Rsb => "rsb",
            Mnem::Add => "add",
            Mnem::Adc => "adc",
            Mnem::Sbc => "sbc",
            Mnem::Rsc => "rsc",
            Mnem::Tst => "tst",
            Mnem::Teq => "teq",
            Mnem::Cmp => "cmp",
            Mnem::Cmn => "cmn",
            Mnem::Orr => "orr",
            Mnem::Mov => "mov",
            Mnem::Movt => "movt",
            Mnem::Bic => "bic",
            Mnem::Mvn => "mvn",
            Mnem::Mul => "mul",
            Mnem::B => "b",
            Mnem::Bl => "bl",
            Mnem::Bx => "bx",
            Mnem::Blx => "blx",
            Mnem::Cbz => "cbz",
            Mnem::Cbnz => "cbnz",
            Mnem::Ldr => "ldr",
            Mnem::Ldrb => "ldrb",
            Mnem::Str => "str",
            Mnem::Strb => "strb",
            Mnem::Ldm => "ldm",
            Mnem::Stm => "stm",
            Mnem::Push => "push",
            Mnem::Pop => "pop",
            Mnem::Swi => "swi",
            Mnem::Stc => "stc",
            Mnem::Ldc => "ldc",
            Mnem::Cdp => "cdp",
            Mnem::Mrc => "mrc",
            Mnem::Mrrc => "mrrc",
            Mnem::Mcr => "mcr",
            Mnem::Mcrr => "mcrr",
        }
    }
}

impl fmt::Display for Mnem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Condition prefix value meaning "always execute".
pub const COND_AL: u8 = 0xE;

/// The fourteen condition predicates, indexed by the condition prefix and
/// applied to the top nibble of the CPSR (N=8, Z=4, C=2, V=1). Prefixes 14
/// and 15 always execute and never consult the table.
pub const CONDITIONS: [fn(u8) -> bool; 14] = [
    |f| f & 4 != 0,                          // eq: Z set
    |f| f & 4 == 0,                          // ne: Z clear
    |f| f & 2 != 0,                          // cs: C set
    |f| f & 2 == 0,                          // cc: C clear
    |f| f & 8 != 0,                          // mi: N set
    |f| f & 8 == 0,                          // pl: N clear
    |f| f & 1 != 0,                          // vs: V set
    |f| f & 1 == 0,                          // vc: V clear
    |f| f & 6 == 2,                          // hi: C set and Z clear
    |f| f & 2 == 0 || f & 4 != 0,            // ls: C clear or Z set
    |f| matches!(f & 9, 0 | 9),              // ge: N == V
    |f| matches!(f & 9, 1 | 8),              // lt: N != V
    |f| f & 4 == 0 && matches!(f & 9, 0 | 9), // gt: Z clear and N == V
    |f| f & 4 != 0 || matches!(f & 9, 1 | 8), // le: Z set or N != V
];

/// Evaluate a condition prefix against a CPSR flag nibble.
#[inline]
pub fn condition_passes(prefix: u8, nzcv: u8) -> bool {
    prefix >= COND_AL || CONDITIONS[prefix as usize](nzcv)
}

/// One way control can leave an instruction.
pub type Branch = (Option<u64>, BranchFlags);

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    pub va: u64,
    /// Instruction length in bytes.
    pub size: u32,
    pub mnem: Mnem,
    /// Condition prefix (0-13 predicated, 14/15 always).
    pub prefixes: u8,
    pub iflags: IfFlags,
    pub opers: SmallVec<[Operand; 4]>,
}

impl Opcode {
    pub fn new(va: u64, size: u32, mnem: Mnem, prefixes: u8, iflags: IfFlags, opers: &[Operand]) -> Self {
        Self {
            va,
            size,
            mnem,
            prefixes,
            iflags,
            opers: SmallVec::from_slice(opers),
        }
    }

    /// Address of the next sequential instruction.
    #[inline]
    pub fn next_va(&self) -> u64 {
        self.va + self.size as u64
    }

    /// True when a conditional prefix gates this instruction.
    #[inline]
    pub fn is_conditional(&self) -> bool {
        self.prefixes < COND_AL
    }

    fn fall(&self) -> Branch {
        (Some(self.next_va()), BranchFlags::FALL)
    }

    /// Enumerate the ways control can leave this instruction.
    ///
    /// Ordinary instructions yield a single fall-through edge. Branches add
    /// their targets; loads of the program counter yield DEREF/TABLE edges;
    /// returns (pop/ldm touching pc, `bx lr` style exits) yield the indirect
    /// target as `None`.
    pub fn branches(&self) -> SmallVec<[Branch; 2]> {
        match self.mnem {
            Mnem::B => {
                let target = self.branch_target();
                if self.is_conditional() {
                    smallvec![
                        (Some(self.next_va()), BranchFlags::FALL | BranchFlags::COND),
                        (target, BranchFlags::COND),
                    ]
                } else {
                    smallvec![(target, BranchFlags::empty())]
                }
            }
            Mnem::Bl | Mnem::Blx => {
                smallvec![self.fall(), (self.branch_target(), BranchFlags::PROC)]
            }
            Mnem::Bx => smallvec![(self.branch_target(), BranchFlags::empty())],
            Mnem::Cbz | Mnem::Cbnz => {
                let target = self.opers.get(1).and_then(|o| match o {
                    Operand::Imm(va) => Some(*va),
                    _ => None,
                });
                smallvec![
                    (Some(self.next_va()), BranchFlags::FALL | BranchFlags::COND),
                    (target, BranchFlags::COND),
                ]
            }
            Mnem::Ldr => match self.opers.first() {
                Some(Operand::Reg(reg)) if *reg == REG_PC => self.pc_load_branches(),
                _ => smallvec![self.fall()],
            },
            Mnem::Pop => match self.opers.first() {
                // pop into pc is a return: flow stops here
                Some(Operand::RegList(mask)) if mask & (1 << REG_PC) != 0 => smallvec![],
                _ => smallvec![self.fall()],
            },
            Mnem::Ldm => match self.opers.get(1) {
                Some(Operand::RegList(mask)) if mask & (1 << REG_PC) != 0 => smallvec![],
                _ => smallvec![self.fall()],
            },
            Mnem::Mov if self.writes_pc() => {
                // mov pc, <x>: discrete when the source is an immediate,
                // otherwise an indirect jump (mov pc, lr etc.)
                match self.opers.last() {
                    Some(Operand::Imm(va)) => smallvec![(Some(*va), BranchFlags::empty())],
                    _ => smallvec![(None, BranchFlags::empty())],
                }
            }
            _ if self.writes_pc() => smallvec![(None, BranchFlags::empty())],
            _ => smallvec![self.fall()],
        }
    }

    fn writes_pc(&self) -> bool {
        matches!(self.opers.first(), Some(Operand::Reg(reg)) if *reg == REG_PC)
            && !matches!(
                self.mnem,
                Mnem::Tst
                    | Mnem::Teq
                    | Mnem::Cmp
                    | Mnem::Cmn
                    | Mnem::B
                    | Mnem::Bl
                    | Mnem::Bx
                    | Mnem::Blx
                    | Mnem::Cbz
                    | Mnem::Cbnz
                    | Mnem::Str
                    | Mnem::Strb
                    | Mnem::Stm
                    | Mnem::Push
            )
    }

    fn branch_target(&self) -> Option<u64> {
        match self.opers.first() {
            Some(Operand::Imm(va)) => Some(*va),
            _ => None,
        }
    }

    /// Branch metadata for `ldr pc, [...]` forms.
    fn pc_load_branches(&self) -> SmallVec<[Branch; 2]> {
        match self.opers.get(1) {
            Some(Operand::Mem {
                base,
                offset,
                index: None,
                ..
            }) if *base == REG_PC => {
                // literal pool: the pointer cell is at pc+8+offset
                let ptr = self.va.wrapping_add(8).wrapping_add(*offset as i64 as u64);
                smallvec![(Some(ptr), BranchFlags::DEREF)]
            }
            Some(Operand::Mem {
                base,
                index: Some(_),
                ..
            }) if *base == REG_PC => {
                // scaled dispatch through a pointer array starting at pc+8
                smallvec![(Some(self.va.wrapping_add(8)), BranchFlags::TABLE)]
            }
            _ => smallvec![(None, BranchFlags::DEREF)],
        }
    }
}

/// Convenience constructors used across the crate and its tests.
impl Opcode {
    /// `bl target` at `va`.
    pub fn bl(va: u64, target: u64) -> Self {
        Opcode::new(va, 4, Mnem::Bl, COND_AL, IfFlags::empty(), &[Operand::Imm(target)])
    }

    /// `push {mask}` at `va`.
    pub fn push(va: u64, mask: u16) -> Self {
        Opcode::new(
            va,
            4,
            Mnem::Push,
            COND_AL,
            IfFlags::DAIB_B | IfFlags::WRITEBACK,
            &[Operand::Reg(REG_SP), Operand::RegList(mask)],
        )
    }

    /// `pop {mask}` at `va`.
    pub fn pop(va: u64, mask: u16) -> Self {
        Opcode::new(
            va,
            4,
            Mnem::Pop,
            COND_AL,
            IfFlags::DAIB_I | IfFlags::WRITEBACK,
            &[Operand::RegList(mask)],
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnem)?;
        for (i, oper) in self.opers.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            match oper {
                Operand::Reg(r) => write!(f, "{}r{}", sep, r & 0xffff)?,
                Operand::ShiftedReg { reg, amount, .. } => write!(f, "{}r{} #{}", sep, reg, amount)?,
                Operand::Imm(v) => write!(f, "{}#0x{:x}", sep, v)?,
                Operand::Mem { base, offset, .. } => write!(f, "{}[r{}, #{}]", sep, base, offset)?,
                Operand::RegList(mask) => write!(f, "{}{{0x{:04x}}}", sep, mask)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_table_covers_signed_compares() {
        // flags nibble: N=8 Z=4 C=2 V=1
        assert!(CONDITIONS[0](0x4)); // eq on Z
        assert!(CONDITIONS[1](0x0)); // ne
        assert!(CONDITIONS[8](0x2)); // hi: C && !Z
        assert!(!CONDITIONS[8](0x6));
        assert!(CONDITIONS[9](0x4)); // ls: Z set
        assert!(CONDITIONS[9](0x0)); // ls: C clear
        assert!(CONDITIONS[10](0x9)); // ge: N == V
        assert!(CONDITIONS[11](0x8)); // lt: N != V
        assert!(CONDITIONS[12](0x0)); // gt
        assert!(!CONDITIONS[12](0x4));
        assert!(CONDITIONS[13](0x4)); // le on Z
        assert!(condition_passes(COND_AL, 0));
        assert!(condition_passes(0xF, 0));
    }

    #[test]
    fn bl_yields_fall_and_proc() {
        let op = Opcode::bl(0x1000, 0x2000);
        let branches = op.branches();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0], (Some(0x1004), BranchFlags::FALL));
        assert_eq!(branches[1], (Some(0x2000), BranchFlags::PROC));
    }

    #[test]
    fn conditional_branch_yields_both_edges() {
        let op = Opcode::new(0x1000, 4, Mnem::B, 0, IfFlags::empty(), &[Operand::Imm(0x1800)]);
        let branches = op.branches();
        assert_eq!(branches[0], (Some(0x1004), BranchFlags::FALL | BranchFlags::COND));
        assert_eq!(branches[1], (Some(0x1800), BranchFlags::COND));
    }

    #[test]
    fn pop_of_pc_terminates_flow() {
        let op = Opcode::pop(0x1000, (1 << 4) | (1 << REG_PC));
        assert!(op.branches().is_empty());
    }

    #[test]
    fn pc_literal_load_is_deref() {
        let op = Opcode::new(
            0x1000,
            4,
            Mnem::Ldr,
            COND_AL,
            IfFlags::empty(),
            &[Operand::Reg(REG_PC), Operand::mem(REG_PC, 0x10)],
        );
        assert_eq!(op.branches()[0], (Some(0x1018), BranchFlags::DEREF));
    }
}
