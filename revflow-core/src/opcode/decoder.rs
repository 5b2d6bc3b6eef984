//! ARM Instruction Decoder
//!
//! Decodes A32 instruction words into [`Opcode`] objects. The subset covers
//! the instructions the analyzer and emulator understand: data processing
//! (immediate and immediate-shifted register forms), multiply, branches,
//! single and multiple loads/stores, software interrupts and the seven
//! coprocessor transfers.
//!
//! # Decoding Algorithm
//! 1. Reject the unconditional (cond = 0b1111) space
//! 2. Check the fixed-pattern instructions (bx/blx/mul/movw/movt)
//! 3. Dispatch on the class field (bits 25-27)
//!
//! Branch targets are resolved to absolute addresses at decode time, so the
//! pipeline offset (+8) never leaks past this module.

use smallvec::smallvec;

use crate::error::{Result, RevflowError};
use crate::registers::REG_SP;

use super::{IfFlags, Mnem, Opcode, Operand, Shift};

/// Decode one A32 instruction word located at `va`.
///
/// # Errors
/// `InvalidInstruction` when the word does not encode a supported
/// instruction. Callers treat this as a localized failure: the code-flow
/// analyzer logs it and continues past the address.
pub fn parse_opcode(va: u64, word: u32) -> Result<Opcode> {
    let cond = ((word >> 28) & 0xf) as u8;
    if cond == 0xF {
        return Err(RevflowError::InvalidInstruction { va, word });
    }

    // bx / blx (register)
    if word & 0x0FFF_FFF0 == 0x012F_FF10 {
        let rm = word & 0xf;
        return Ok(Opcode::new(va, 4, Mnem::Bx, cond, IfFlags::empty(), &[Operand::Reg(rm)]));
    }
    if word & 0x0FFF_FFF0 == 0x012F_FF30 {
        let rm = word & 0xf;
        return Ok(Opcode::new(va, 4, Mnem::Blx, cond, IfFlags::empty(), &[Operand::Reg(rm)]));
    }

    // mul{s} rd, rm, rs
    if word & 0x0FC0_00F0 == 0x0000_0090 {
        let rd = (word >> 16) & 0xf;
        let rs = (word >> 8) & 0xf;
        let rm = word & 0xf;
        let iflags = if word & (1 << 20) != 0 { IfFlags::PSR_S } else { IfFlags::empty() };
        return Ok(Opcode::new(
            va,
            4,
            Mnem::Mul,
            cond,
            iflags,
            &[Operand::Reg(rd), Operand::Reg(rm), Operand::Reg(rs)],
        ));
    }

    match (word >> 25) & 0x7 {
        0b000 | 0b001 => decode_dataproc(va, word, cond),
        0b010 => decode_ldr_str_imm(va, word, cond),
        0b011 => decode_ldr_str_reg(va, word, cond),
        0b100 => decode_ldm_stm(va, word, cond),
        0b101 => decode_branch(va, word, cond),
        0b110 => decode_coproc_transfer(va, word, cond),
        0b111 => decode_coproc_or_swi(va, word, cond),
        _ => unreachable!(),
    }
}

/// Expand a data-processing operand 2 field.
fn decode_oper2(va: u64, word: u32, immediate: bool) -> Result<Operand> {
    if immediate {
        let imm8 = word & 0xff;
        let rot = ((word >> 8) & 0xf) * 2;
        return Ok(Operand::Imm(imm8.rotate_right(rot) as u64));
    }

    // register shifts by register (bit 4) are outside the supported subset
    if word & (1 << 4) != 0 {
        return Err(RevflowError::InvalidInstruction { va, word });
    }

    let rm = word & 0xf;
    let amount = ((word >> 7) & 0x1f) as u8;
    let shift = match (word >> 5) & 0x3 {
        0 => Shift::Lsl,
        1 => Shift::Lsr,
        2 => Shift::Asr,
        _ => Shift::Ror,
    };
    if amount == 0 && shift == Shift::Lsl {
        Ok(Operand::Reg(rm))
    } else {
        Ok(Operand::ShiftedReg { reg: rm, shift, amount })
    }
}

fn decode_dataproc(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    let immediate = word & (1 << 25) != 0;
    let sflag = word & (1 << 20) != 0;
    let rn = (word >> 16) & 0xf;
    let rd = (word >> 12) & 0xf;

    // movw / movt carve a 16-bit immediate out of the compare space
    if immediate && word & 0x0FF0_0000 == 0x0300_0000 {
        let imm16 = (((word >> 4) & 0xf000) | (word & 0xfff)) as u64;
        return Ok(Opcode::new(va, 4, Mnem::Mov, cond, IfFlags::empty(), &[Operand::Reg(rd), Operand::Imm(imm16)]));
    }
    if immediate && word & 0x0FF0_0000 == 0x0340_0000 {
        let imm16 = (((word >> 4) & 0xf000) | (word & 0xfff)) as u64;
        return Ok(Opcode::new(va, 4, Mnem::Movt, cond, IfFlags::empty(), &[Operand::Reg(rd), Operand::Imm(imm16)]));
    }

    let opcode = (word >> 21) & 0xf;
    let mnem = match opcode {
        0 => Mnem::And,
        1 => Mnem::Eor,
        2 => Mnem::Sub,
        3 => Mnem::Rsb,
        4 => Mnem::Add,
        5 => Mnem::Adc,
        6 => Mnem::Sbc,
        7 => Mnem::Rsc,
        8 => Mnem::Tst,
        9 => Mnem::Teq,
        10 => Mnem::Cmp,
        11 => Mnem::Cmn,
        12 => Mnem::Orr,
        13 => Mnem::Mov,
        14 => Mnem::Bic,
        _ => Mnem::Mvn,
    };

    // the compare encodings without S are msr/mrs territory
    if matches!(mnem, Mnem::Tst | Mnem::Teq | Mnem::Cmp | Mnem::Cmn) && !sflag {
        return Err(RevflowError::InvalidInstruction { va, word });
    }

    let oper2 = decode_oper2(va, word, immediate)?;
    let iflags = if sflag { IfFlags::PSR_S } else { IfFlags::empty() };

    let opers = match mnem {
        Mnem::Mov | Mnem::Mvn => smallvec![Operand::Reg(rd), oper2],
        Mnem::Tst | Mnem::Teq | Mnem::Cmp | Mnem::Cmn => smallvec![Operand::Reg(rn), oper2],
        _ => smallvec![Operand::Reg(rd), Operand::Reg(rn), oper2],
    };

    Ok(Opcode { va, size: 4, mnem, prefixes: cond, iflags, opers })
}

fn transfer_mnem(load: bool, byte: bool) -> Mnem {
    match (load, byte) {
        (true, false) => Mnem::Ldr,
        (true, true) => Mnem::Ldrb,
        (false, false) => Mnem::Str,
        (false, true) => Mnem::Strb,
    }
}

fn decode_ldr_str_imm(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    let pre = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let byte = word & (1 << 22) != 0;
    let wback = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    let rn = (word >> 16) & 0xf;
    let rd = (word >> 12) & 0xf;
    let imm12 = (word & 0xfff) as i32;

    let mem = Operand::Mem {
        base: rn,
        offset: if up { imm12 } else { -imm12 },
        index: None,
        shift: Shift::Lsl,
        shift_amount: 0,
        size: if byte { 1 } else { 4 },
        writeback: wback || !pre,
        post: !pre,
    };

    Ok(Opcode::new(
        va,
        4,
        transfer_mnem(load, byte),
        cond,
        IfFlags::empty(),
        &[Operand::Reg(rd), mem],
    ))
}

fn decode_ldr_str_reg(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    if word & (1 << 4) != 0 {
        return Err(RevflowError::InvalidInstruction { va, word });
    }
    let pre = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let byte = word & (1 << 22) != 0;
    let wback = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    if !up {
        // negative register offsets are outside the supported subset
        return Err(RevflowError::InvalidInstruction { va, word });
    }

    let rn = (word >> 16) & 0xf;
    let rd = (word >> 12) & 0xf;
    let rm = word & 0xf;
    let amount = ((word >> 7) & 0x1f) as u8;
    let shift = match (word >> 5) & 0x3 {
        0 => Shift::Lsl,
        1 => Shift::Lsr,
        2 => Shift::Asr,
        _ => Shift::Ror,
    };

    let mem = Operand::Mem {
        base: rn,
        offset: 0,
        index: Some(rm),
        shift,
        shift_amount: amount,
        size: if byte { 1 } else { 4 },
        writeback: wback || !pre,
        post: !pre,
    };

    Ok(Opcode::new(
        va,
        4,
        transfer_mnem(load, byte),
        cond,
        IfFlags::empty(),
        &[Operand::Reg(rd), mem],
    ))
}

fn decode_ldm_stm(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    let load = word & (1 << 20) != 0;
    let mask = (word & 0xffff) as u16;

    // push/pop are the sp-writeback stmdb/ldmia forms
    if word & 0x0FFF_0000 == 0x092D_0000 {
        return Ok(Opcode::new(
            va,
            4,
            Mnem::Push,
            cond,
            IfFlags::DAIB_B | IfFlags::WRITEBACK,
            &[Operand::Reg(REG_SP), Operand::RegList(mask)],
        ));
    }
    if word & 0x0FFF_0000 == 0x08BD_0000 {
        return Ok(Opcode::new(
            va,
            4,
            Mnem::Pop,
            cond,
            IfFlags::DAIB_I | IfFlags::WRITEBACK,
            &[Operand::RegList(mask)],
        ));
    }

    let rn = (word >> 16) & 0xf;
    let mut iflags = IfFlags::empty();
    if word & (1 << 23) != 0 {
        iflags |= IfFlags::DAIB_I;
    }
    if word & (1 << 24) != 0 {
        iflags |= IfFlags::DAIB_B;
    }
    if word & (1 << 21) != 0 {
        iflags |= IfFlags::WRITEBACK;
    }

    Ok(Opcode::new(
        va,
        4,
        if load { Mnem::Ldm } else { Mnem::Stm },
        cond,
        iflags,
        &[Operand::Reg(rn), Operand::RegList(mask)],
    ))
}

fn decode_branch(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    let link = word & (1 << 24) != 0;
    let offset = ((word & 0x00FF_FFFF) << 8) as i32 >> 6; // sign-extend, *4
    let target = va.wrapping_add(8).wrapping_add(offset as i64 as u64);
    Ok(Opcode::new(
        va,
        4,
        if link { Mnem::Bl } else { Mnem::B },
        cond,
        IfFlags::empty(),
        &[Operand::Imm(target)],
    ))
}

fn decode_coproc_transfer(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    let cp = (word >> 8) & 0xf;
    let op = (word >> 20) & 0x1f;

    // mcrr / mrrc share the class with ldc/stc
    if op == 0b00100 || op == 0b00101 {
        let rt = (word >> 12) & 0xf;
        let rt2 = (word >> 16) & 0xf;
        let opc = (word >> 4) & 0xf;
        let crm = word & 0xf;
        let mnem = if op == 0b00101 { Mnem::Mrrc } else { Mnem::Mcrr };
        return Ok(Opcode::new(
            va,
            4,
            mnem,
            cond,
            IfFlags::empty(),
            &[
                Operand::Imm(cp as u64),
                Operand::Imm(opc as u64),
                Operand::Reg(rt),
                Operand::Reg(rt2),
                Operand::Imm(crm as u64),
            ],
        ));
    }

    let load = word & (1 << 20) != 0;
    let rn = (word >> 16) & 0xf;
    let crd = (word >> 12) & 0xf;
    let imm8 = (word & 0xff) as i32;
    let up = word & (1 << 23) != 0;
    Ok(Opcode::new(
        va,
        4,
        if load { Mnem::Ldc } else { Mnem::Stc },
        cond,
        IfFlags::empty(),
        &[
            Operand::Imm(cp as u64),
            Operand::Imm(crd as u64),
            Operand::mem(rn, if up { imm8 * 4 } else { -imm8 * 4 }),
        ],
    ))
}

fn decode_coproc_or_swi(va: u64, word: u32, cond: u8) -> Result<Opcode> {
    if word & (1 << 24) != 0 {
        let imm24 = (word & 0x00FF_FFFF) as u64;
        return Ok(Opcode::new(va, 4, Mnem::Swi, cond, IfFlags::empty(), &[Operand::Imm(imm24)]));
    }

    let cp = (word >> 8) & 0xf;
    let opc1 = (word >> 21) & 0x7;
    let crn = (word >> 16) & 0xf;
    let crm = word & 0xf;
    let opc2 = (word >> 5) & 0x7;

    if word & (1 << 4) != 0 {
        let rt = (word >> 12) & 0xf;
        let mnem = if word & (1 << 20) != 0 { Mnem::Mrc } else { Mnem::Mcr };
        return Ok(Opcode::new(
            va,
            4,
            mnem,
            cond,
            IfFlags::empty(),
            &[
                Operand::Imm(cp as u64),
                Operand::Imm(opc1 as u64),
                Operand::Reg(rt),
                Operand::Imm(crn as u64),
                Operand::Imm(crm as u64),
                Operand::Imm(opc2 as u64),
            ],
        ));
    }

    let crd = (word >> 12) & 0xf;
    Ok(Opcode::new(
        va,
        4,
        Mnem::Cdp,
        cond,
        IfFlags::empty(),
        &[
            Operand::Imm(cp as u64),
            Operand::Imm(((word >> 20) & 0xf) as u64),
            Operand::Imm(crd as u64),
            Operand::Imm(crn as u64),
            Operand::Imm(crm as u64),
            Operand::Imm(opc2 as u64),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::BranchFlags;
    use crate::registers::{REG_LR, REG_PC};

    #[test]
    fn decode_push_pop() {
        // push {r4, lr}
        let op = parse_opcode(0x1000, 0xE92D_4010).unwrap();
        assert_eq!(op.mnem, Mnem::Push);
        assert_eq!(op.opers[1], Operand::RegList(0x4010));
        assert!(op.iflags.contains(IfFlags::DAIB_B));

        // pop {r4, pc}
        let op = parse_opcode(0x1008, 0xE8BD_8010).unwrap();
        assert_eq!(op.mnem, Mnem::Pop);
        assert_eq!(op.opers[0], Operand::RegList(0x8010));
        assert!(op.branches().is_empty());
    }

    #[test]
    fn decode_bl_resolves_target() {
        // bl 0x1100 from 0x1004: offset (0x1100 - 0x100c) >> 2 = 0x3d
        let op = parse_opcode(0x1004, 0xEB00_003D).unwrap();
        assert_eq!(op.mnem, Mnem::Bl);
        assert_eq!(op.opers[0], Operand::Imm(0x1100));
        let branches = op.branches();
        assert_eq!(branches[1], (Some(0x1100), BranchFlags::PROC));
    }

    #[test]
    fn decode_backward_branch() {
        // b 0x0FF8 from 0x1000: offset -0x10 >> 2 = -4
        let op = parse_opcode(0x1000, 0xEAFF_FFFC).unwrap();
        assert_eq!(op.opers[0], Operand::Imm(0x0FF8));
    }

    #[test]
    fn decode_conditional_branch() {
        // bne 0x1008 from 0x1000
        let op = parse_opcode(0x1000, 0x1A00_0000).unwrap();
        assert_eq!(op.mnem, Mnem::B);
        assert_eq!(op.prefixes, 1);
        assert_eq!(op.opers[0], Operand::Imm(0x1008));
        assert_eq!(op.branches().len(), 2);
    }

    #[test]
    fn decode_adds_register_form() {
        // adds r0, r1, r2
        let op = parse_opcode(0x1000, 0xE091_0002).unwrap();
        assert_eq!(op.mnem, Mnem::Add);
        assert!(op.iflags.contains(IfFlags::PSR_S));
        assert_eq!(
            &op.opers[..],
            &[Operand::Reg(0), Operand::Reg(1), Operand::Reg(2)]
        );
    }

    #[test]
    fn decode_subs_pc_lr() {
        // subs pc, lr, #4 (exception return idiom)
        let op = parse_opcode(0x1000, 0xE24F_F004).unwrap();
        assert_eq!(op.mnem, Mnem::Sub);
        assert!(op.iflags.contains(IfFlags::PSR_S));
        assert_eq!(
            &op.opers[..],
            &[Operand::Reg(REG_PC), Operand::Reg(REG_LR), Operand::Imm(4)]
        );
    }

    #[test]
    fn decode_ldmdb_writeback() {
        // ldmdb sp!, {r4, r5, r6}
        let op = parse_opcode(0x1000, 0xE934_0070).unwrap();
        assert_eq!(op.mnem, Mnem::Ldm);
        assert_eq!(op.opers[0], Operand::Reg(REG_SP));
        assert_eq!(op.opers[1], Operand::RegList(0x0070));
        assert!(op.iflags.contains(IfFlags::DAIB_B));
        assert!(op.iflags.contains(IfFlags::WRITEBACK));
        assert!(!op.iflags.contains(IfFlags::DAIB_I));
    }

    #[test]
    fn decode_rotated_immediate() {
        // mov r0, #0x10000000 (imm8 = 1, rotate = 4)
        let op = parse_opcode(0x1000, 0xE3A0_0201).unwrap();
        assert_eq!(op.mnem, Mnem::Mov);
        assert_eq!(op.opers[1], Operand::Imm(0x1000_0000));
    }

    #[test]
    fn decode_bx_lr() {
        let op = parse_opcode(0x1000, 0xE12F_FF1E).unwrap();
        assert_eq!(op.mnem, Mnem::Bx);
        assert_eq!(op.opers[0], Operand::Reg(REG_LR));
        assert_eq!(op.branches()[0], (None, BranchFlags::empty()));
    }

    #[test]
    fn decode_mrc() {
        // mrc p15, 0, r0, c1, c0, 0
        let op = parse_opcode(0x1000, 0xEE11_0F10).unwrap();
        assert_eq!(op.mnem, Mnem::Mrc);
        assert_eq!(op.opers[0], Operand::Imm(15));
        assert_eq!(op.opers[2], Operand::Reg(0));
    }

    #[test]
    fn decode_swi() {
        let op = parse_opcode(0x1000, 0xEF00_0042).unwrap();
        assert_eq!(op.mnem, Mnem::Swi);
        assert_eq!(op.opers[0], Operand::Imm(0x42));
    }

    #[test]
    fn decode_ldr_literal_pool() {
        // ldr pc, [pc, #0x18]
        let op = parse_opcode(0x1000, 0xE59F_F018).unwrap();
        assert_eq!(op.mnem, Mnem::Ldr);
        assert_eq!(op.branches()[0], (Some(0x1020), BranchFlags::DEREF));
    }

    #[test]
    fn decode_ldr_table_dispatch() {
        // ldr pc, [pc, r2, lsl #2]
        let op = parse_opcode(0x1000, 0xE79F_F102).unwrap();
        assert_eq!(op.mnem, Mnem::Ldr);
        assert_eq!(op.branches()[0], (Some(0x1008), BranchFlags::TABLE));
    }

    #[test]
    fn unconditional_space_is_invalid() {
        let err = parse_opcode(0x1000, 0xF000_0000).unwrap_err();
        assert_eq!(
            err,
            RevflowError::InvalidInstruction { va: 0x1000, word: 0xF000_0000 }
        );
    }
}
