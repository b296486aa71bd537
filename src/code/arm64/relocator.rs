//! Relocation of displaced entry instructions
//!
//! The word overwritten by the hook jump has to run from inside the trampoline. Position independent words are
//! copied as-is; PC-relative ones are rewritten into an equivalent sequence in the trampoline's tail area that
//! reproduces the effect the word would have had at its original address.

use thiserror::Error;

use super::writer::{CodeWriter, Reg, WriteError};
use super::{branch_target, INSN_SIZE};

/// Errors while relocating an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelocateError {
    /// The instruction reads PC in a way that cannot be reproduced from another address
    #[error("instruction {insn:#010x} at {pc:#x} cannot be relocated")]
    Unsupported {
        /// Instruction word
        insn: u32,
        /// Address the instruction was taken from
        pc: u64,
    },
    /// The function can't hold an aligned instruction word
    #[error("function at {pc:#x} ({size} bytes) has no room for a jump")]
    Misplaced {
        /// Function address
        pc: u64,
        /// Function size in bytes
        size: usize,
    },
    /// The trampoline ran out of space for the relocated sequence
    #[error("{0}")]
    WriteError(#[from] WriteError),
}

/// Classification of an instruction by how it depends on PC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// Position independent, copied verbatim
    Other,
    /// `B imm26`
    B,
    /// `BL imm26`
    Bl,
    /// `B.cond imm19`
    BCond,
    /// `CBZ`/`CBNZ`
    CbzCbnz,
    /// `TBZ`/`TBNZ`
    TbzTbnz,
    /// `ADR`
    Adr,
    /// `ADRP`
    Adrp,
    /// `LDR Xt, literal`
    LdrLiteral64,
    /// `LDR Wt, literal`
    LdrLiteral32,
    /// `LDRSW Xt, literal`
    LdrswLiteral,
    /// SIMD/FP literal loads and `PRFM` literal
    Unsupported,
}

/// Classifies `insn`
pub fn insn_kind(insn: u32) -> InsnKind {
    match insn & 0xFC00_0000 {
        0x1400_0000 => return InsnKind::B,
        0x9400_0000 => return InsnKind::Bl,
        _ => {}
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        return InsnKind::BCond;
    }
    match insn & 0x7F00_0000 {
        0x3400_0000 | 0x3500_0000 => return InsnKind::CbzCbnz,
        0x3600_0000 | 0x3700_0000 => return InsnKind::TbzTbnz,
        _ => {}
    }
    match insn & 0x9F00_0000 {
        0x1000_0000 => return InsnKind::Adr,
        0x9000_0000 => return InsnKind::Adrp,
        _ => {}
    }
    match insn & 0xFF00_0000 {
        0x5800_0000 => InsnKind::LdrLiteral64,
        0x1800_0000 => InsnKind::LdrLiteral32,
        0x9800_0000 => InsnKind::LdrswLiteral,
        0x1C00_0000 | 0x5C00_0000 | 0x9C00_0000 | 0xD800_0000 => InsnKind::Unsupported,
        _ => InsnKind::Other,
    }
}

/// Sign extends the low `bits` of `value`
fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Byte offset encoded in an imm19 field (bits 5..24)
fn imm19_offset(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x7FFFF, 19) << 2
}

/// Byte offset encoded in an imm14 field (bits 5..19)
fn imm14_offset(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x3FFF, 14) << 2
}

/// Immediate of `ADR`/`ADRP` (immhi:immlo)
fn adr_imm(insn: u32) -> i64 {
    let immlo = (insn >> 29) & 0x3;
    let immhi = (insn >> 5) & 0x7FFFF;
    sign_extend((immhi << 2) | immlo, 21)
}

/// Destination register field
fn rt(insn: u32) -> u32 {
    insn & 0x1F
}

/// Adds a signed byte offset to an address
fn offset_pc(pc: u64, offset: i64) -> u64 {
    (pc as i64).wrapping_add(offset) as u64
}

/// Where relocated code goes inside a trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocSite {
    /// Offset of the single word slot the displaced instruction occupies. Execution continues at `slot + 4`.
    pub slot: usize,
    /// Offset where longer sequences for PC-relative instructions may be emitted
    pub tail: usize,
}

/// Relocates `insn`, originally at `src_pc`, into `code` (which executes at `code_pc`).
///
/// Returns the number of tail bytes used. Position independent instructions are written to the slot and use no tail.
pub fn relocate_insn(
    code: &mut [u8],
    code_pc: u64,
    site: RelocSite,
    insn: u32,
    src_pc: u64,
) -> Result<usize, RelocateError> {
    let kind = insn_kind(insn);
    if kind == InsnKind::Other {
        CodeWriter::at(code, code_pc, site.slot).put_u32(insn)?;
        return Ok(0);
    }

    let slot_pc = code_pc + site.slot as u64;
    let tail_pc = code_pc + site.tail as u64;
    // where the template carries on after the displaced word
    let resume_pc = slot_pc + INSN_SIZE as u64;
    // value the link register would have received at the original address
    let return_pc = src_pc + INSN_SIZE as u64;

    let mut tail = CodeWriter::at(code, code_pc, site.tail);
    match kind {
        InsnKind::Other | InsnKind::Unsupported => {
            return Err(RelocateError::Unsupported { insn, pc: src_pc })
        }
        InsnKind::B => {
            let target = branch_target(src_pc as usize, insn) as u64;
            tail.put_ldr_br_address(Reg::X16, target)?;
        }
        InsnKind::Bl => {
            let target = branch_target(src_pc as usize, insn) as u64;
            tail.put_ldr_reg_address(30, return_pc)?;
            tail.put_ldr_br_address(Reg::X16, target)?;
        }
        InsnKind::BCond => {
            let target = offset_pc(src_pc, imm19_offset(insn));
            let cond = insn & 0xF;
            if cond >= 0xE {
                tail.put_ldr_br_address(Reg::X16, target)?;
            } else {
                // b.<inverted cond> over the long branch
                tail.put_u32((insn & !0x00FF_FFEF) | (5 << 5) | (cond ^ 1))?;
                tail.put_ldr_br_address(Reg::X16, target)?;
                tail.put_b_imm(resume_pc)?;
            }
        }
        InsnKind::CbzCbnz => {
            let target = offset_pc(src_pc, imm19_offset(insn));
            tail.put_u32(((insn ^ (1 << 24)) & !0x00FF_FFE0) | (5 << 5))?;
            tail.put_ldr_br_address(Reg::X16, target)?;
            tail.put_b_imm(resume_pc)?;
        }
        InsnKind::TbzTbnz => {
            let target = offset_pc(src_pc, imm14_offset(insn));
            tail.put_u32(((insn ^ (1 << 24)) & !0x0007_FFE0) | (5 << 5))?;
            tail.put_ldr_br_address(Reg::X16, target)?;
            tail.put_b_imm(resume_pc)?;
        }
        InsnKind::Adr => {
            let value = offset_pc(src_pc, adr_imm(insn));
            tail.put_ldr_reg_address(rt(insn), value)?;
            tail.put_b_imm(resume_pc)?;
        }
        InsnKind::Adrp => {
            let value = offset_pc(src_pc & !0xFFF, adr_imm(insn) << 12);
            tail.put_ldr_reg_address(rt(insn), value)?;
            tail.put_b_imm(resume_pc)?;
        }
        InsnKind::LdrLiteral64 | InsnKind::LdrLiteral32 | InsnKind::LdrswLiteral => {
            let address = offset_pc(src_pc, imm19_offset(insn));
            let rt = rt(insn);
            // load the literal's address into the destination, then load through it
            tail.put_ldr_reg_address(rt, address)?;
            let load = match kind {
                InsnKind::LdrLiteral64 => 0xF940_0000,
                InsnKind::LdrLiteral32 => 0xB940_0000,
                _ => 0xB980_0000,
            };
            tail.put_u32(load | (rt << 5) | rt)?;
            tail.put_b_imm(resume_pc)?;
        }
    }
    let used = tail.offset() - site.tail;

    CodeWriter::at(code, code_pc, site.slot).put_b_imm(tail_pc)?;
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Base address the test buffers pretend to execute at
    const CODE_PC: u64 = 0x10_0000;
    /// Address the displaced instruction pretends to come from
    const SRC_PC: u64 = 0x4000_1000;
    /// Slot and tail layout used by the tests
    const SITE: RelocSite = RelocSite {
        slot: 8,
        tail: 32,
    };

    /// Reads back the word at `offset`
    fn word(buf: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    /// Reads back the literal at `offset`
    fn quad(buf: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
    }

    /// Asserts the slot branches into the tail
    fn assert_slot_to_tail(buf: &[u8]) {
        // (32 - 8) / 4
        assert_eq!(word(buf, SITE.slot), 0x1400_0006);
    }

    /// Asserts the word at `offset` branches back to the word after the slot
    fn assert_resumes(buf: &[u8], offset: usize) {
        let pc = CODE_PC as usize + offset;
        assert_eq!(
            branch_target(pc, word(buf, offset)),
            CODE_PC as usize + SITE.slot + 4
        );
    }

    #[test]
    /// Classification of common prologue instructions
    fn test_insn_kind() {
        // stp x29, x30, [sp, #-16]!
        assert_eq!(insn_kind(0xA9BF_7BFD), InsnKind::Other);
        // paciasp
        assert_eq!(insn_kind(0xD503_233F), InsnKind::Other);
        // mov x29, sp
        assert_eq!(insn_kind(0x9100_03FD), InsnKind::Other);
        assert_eq!(insn_kind(0x1400_0010), InsnKind::B);
        assert_eq!(insn_kind(0x9400_0010), InsnKind::Bl);
        // b.ne #8
        assert_eq!(insn_kind(0x5400_0041), InsnKind::BCond);
        // cbz x0, #8 / cbnz w1, #8
        assert_eq!(insn_kind(0xB400_0040), InsnKind::CbzCbnz);
        assert_eq!(insn_kind(0x3500_0041), InsnKind::CbzCbnz);
        // tbz w0, #3, #8
        assert_eq!(insn_kind(0x3618_0040), InsnKind::TbzTbnz);
        // adr x0, #0 / adrp x0, #0
        assert_eq!(insn_kind(0x1000_0000), InsnKind::Adr);
        assert_eq!(insn_kind(0x9000_0000), InsnKind::Adrp);
        assert_eq!(insn_kind(0x5800_0040), InsnKind::LdrLiteral64);
        assert_eq!(insn_kind(0x1800_0040), InsnKind::LdrLiteral32);
        assert_eq!(insn_kind(0x9800_0040), InsnKind::LdrswLiteral);
        // ldr d0, #8 / prfm pldl1keep, #8
        assert_eq!(insn_kind(0x5C00_0040), InsnKind::Unsupported);
        assert_eq!(insn_kind(0xD800_0040), InsnKind::Unsupported);
    }

    #[test]
    /// Position independent instructions are copied into the slot and nothing else is written
    fn test_relocate_verbatim() {
        let mut buf = [0u8; 64];
        let used = relocate_insn(&mut buf, CODE_PC, SITE, 0xA9BF_7BFD, SRC_PC).unwrap();
        assert_eq!(used, 0);
        assert_eq!(word(&buf, SITE.slot), 0xA9BF_7BFD);
        assert!(buf[SITE.tail..].iter().all(|b| *b == 0));
    }

    #[test]
    /// A BL keeps its original return address and absolute destination
    fn test_relocate_bl() {
        let mut buf = [0u8; 96];
        // bl #0x100
        let used = relocate_insn(&mut buf, CODE_PC, SITE, 0x9400_0040, SRC_PC).unwrap();
        assert_eq!(used, 32);
        assert_slot_to_tail(&buf);
        // ldr x30, #8
        assert_eq!(word(&buf, 32), 0x5800_005E);
        assert_eq!(quad(&buf, 40), SRC_PC + 4);
        // ldr x16, #8; br x16
        assert_eq!(word(&buf, 48), 0x5800_0050);
        assert_eq!(word(&buf, 52), 0xD61F_0200);
        assert_eq!(quad(&buf, 56), SRC_PC + 0x100);
    }

    #[test]
    /// A conditional branch becomes an inverted skip over an absolute branch
    fn test_relocate_b_cond() {
        let mut buf = [0u8; 96];
        // b.eq #-0x20
        let insn = 0x5400_0000 | ((0x7FFF8 & 0x7FFFF) << 5);
        let used = relocate_insn(&mut buf, CODE_PC, SITE, insn, SRC_PC).unwrap();
        assert_eq!(used, 24);
        assert_slot_to_tail(&buf);
        // b.ne #20
        assert_eq!(word(&buf, 32), 0x5400_00A1);
        assert_eq!(quad(&buf, 44), SRC_PC - 0x20);
        assert_resumes(&buf, 52);
    }

    #[test]
    /// CBZ flips to CBNZ keeping the register and width
    fn test_relocate_cbz() {
        let mut buf = [0u8; 96];
        // cbz x3, #0x40
        let used = relocate_insn(&mut buf, CODE_PC, SITE, 0xB400_0203, SRC_PC).unwrap();
        assert_eq!(used, 24);
        // cbnz x3, #20
        assert_eq!(word(&buf, 32), 0xB500_00A3);
        assert_eq!(quad(&buf, 44), SRC_PC + 0x40);
        assert_resumes(&buf, 52);
    }

    #[test]
    /// TBNZ flips to TBZ keeping the tested bit
    fn test_relocate_tbnz() {
        let mut buf = [0u8; 96];
        // tbnz w0, #3, #8
        let used = relocate_insn(&mut buf, CODE_PC, SITE, 0x3718_0040, SRC_PC).unwrap();
        assert_eq!(used, 24);
        // tbz w0, #3, #20
        assert_eq!(word(&buf, 32), 0x3618_00A0);
        assert_eq!(quad(&buf, 44), SRC_PC + 8);
    }

    #[test]
    /// ADRP materializes the page of the original location
    fn test_relocate_adrp() {
        let mut buf = [0u8; 96];
        // adrp x2, #0x3000
        let insn = 0x9000_0002 | (3 << 29);
        let used = relocate_insn(&mut buf, CODE_PC, SITE, insn, SRC_PC + 0x234).unwrap();
        assert_eq!(used, 20);
        // ldr x2, #8
        assert_eq!(word(&buf, 32), 0x5800_0042);
        assert_eq!(quad(&buf, 40), (SRC_PC & !0xFFF) + 0x3000);
        assert_resumes(&buf, 48);
    }

    #[test]
    /// ADR yields the original absolute address
    fn test_relocate_adr() {
        let mut buf = [0u8; 96];
        // adr x5, #-4
        let insn = 0x1000_0005 | (0x7FFFF << 5);
        relocate_insn(&mut buf, CODE_PC, SITE, insn, SRC_PC).unwrap();
        assert_eq!(word(&buf, 32), 0x5800_0045);
        assert_eq!(quad(&buf, 40), SRC_PC - 4);
    }

    #[test]
    /// Literal loads read through the original literal address
    fn test_relocate_ldr_literal() {
        let mut buf = [0u8; 96];
        // ldr w7, #0x10
        let used = relocate_insn(&mut buf, CODE_PC, SITE, 0x1800_0087, SRC_PC).unwrap();
        assert_eq!(used, 24);
        assert_eq!(word(&buf, 32), 0x5800_0047);
        assert_eq!(quad(&buf, 40), SRC_PC + 0x10);
        // ldr w7, [x7]
        assert_eq!(word(&buf, 48), 0xB940_00E7);
        assert_resumes(&buf, 52);
    }

    #[test]
    /// Unsupported literal loads are rejected and leave the slot untouched
    fn test_relocate_unsupported() {
        let mut buf = [0u8; 96];
        assert_eq!(
            relocate_insn(&mut buf, CODE_PC, SITE, 0x5C00_0040, SRC_PC),
            Err(RelocateError::Unsupported {
                insn: 0x5C00_0040,
                pc: SRC_PC
            })
        );
        assert_eq!(word(&buf, SITE.slot), 0);
    }

    #[test]
    /// A tail that doesn't fit is reported instead of truncated
    fn test_relocate_overflow() {
        let mut buf = [0u8; 48];
        assert!(matches!(
            relocate_insn(&mut buf, CODE_PC, SITE, 0x9400_0040, SRC_PC),
            Err(RelocateError::WriteError(_))
        ));
        assert_eq!(word(&buf, SITE.slot), 0);
    }
}
