//! # AArch64
//!
//! Encoding helpers for the 32-bit A64 instruction words written over hooked entry points

pub mod relocator;
pub mod writer;

use thiserror::Error;

/// Width of one instruction word
pub const INSN_SIZE: usize = 4;

/// `NOP`
pub const NOP: u32 = 0xD503_201F;

/// `MOV X0, X0`, used as filler where the template must fall through without side effects
pub const FILLER: u32 = 0xAA00_03E0;

/// `BRK #0x800`, left in template slots that have to be patched before the code may run
pub const UNPATCHED: u32 = 0xD421_0000;

/// Furthest distance (in either direction) reachable by a single `B` instruction (128 MiB)
pub const BRANCH_RANGE: usize = 0x0800_0000;

/// Size of a PLT/veneer slot, see [`veneer`]
pub const VENEER_SIZE: usize = 16;

/// Errors while synthesizing a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Source or destination is not instruction-aligned
    #[error("branch {from:#x} -> {to:#x} is not 4-byte aligned")]
    Misaligned {
        /// Address the branch is written at
        from: usize,
        /// Address the branch goes to
        to: usize,
    },
    /// Destination is further than [`BRANCH_RANGE`] and no veneer is available
    #[error("branch {from:#x} -> {to:#x} is out of range")]
    OutOfRange {
        /// Address the branch is written at
        from: usize,
        /// Address the branch goes to
        to: usize,
    },
}

/// Returns true if `insn` is an unconditional immediate branch (`B imm26`).
///
/// Live patching layers hook with the same instruction, so this is how an existing hook is detected.
pub fn is_insn_b(insn: u32) -> bool {
    insn & 0xFC00_0000 == 0x1400_0000
}

/// Returns true if `insn` is a `BL imm26`
pub fn is_insn_bl(insn: u32) -> bool {
    insn & 0xFC00_0000 == 0x9400_0000
}

/// Returns true if `to` is reachable from `from` with a single `B`
pub fn in_branch_range(from: usize, to: usize) -> bool {
    let offset = (to as i64).wrapping_sub(from as i64);
    (-(BRANCH_RANGE as i64)..BRANCH_RANGE as i64).contains(&offset)
}

/// Encodes `B to` placed at `from`
pub fn make_b(from: usize, to: usize) -> Result<u32, EncodeError> {
    if from % INSN_SIZE != 0 || to % INSN_SIZE != 0 {
        return Err(EncodeError::Misaligned { from, to });
    }
    if !in_branch_range(from, to) {
        return Err(EncodeError::OutOfRange { from, to });
    }
    let imm26 = (((to as i64).wrapping_sub(from as i64) >> 2) as u32) & 0x03FF_FFFF;
    Ok(0x1400_0000 | imm26)
}

/// Synthesizes the jump written over a hooked entry point.
///
/// Branches straight to `to` when it is in range, otherwise through the `plt` veneer (which must already hold a
/// [`veneer`] to `to`).
pub fn make_jump_insn(from: usize, to: usize, plt: Option<usize>) -> Result<u32, EncodeError> {
    match make_b(from, to) {
        Err(EncodeError::OutOfRange { .. }) => match plt {
            Some(plt) => make_b(from, plt),
            None => Err(EncodeError::OutOfRange { from, to }),
        },
        result => result,
    }
}

/// Decodes the destination of a `B`/`BL` located at `pc`
pub fn branch_target(pc: usize, insn: u32) -> usize {
    let imm26 = ((insn & 0x03FF_FFFF) << 6) as i32 >> 6;
    (pc as i64).wrapping_add((imm26 as i64) << 2) as usize
}

/// Generates an absolute jump to `target` usable from anywhere in the address space:
///
/// ```text
/// LDR X16, #8
/// BR  X16
/// .quad target
/// ```
pub fn veneer(target: usize) -> [u8; VENEER_SIZE] {
    let mut code = [0u8; VENEER_SIZE];
    code[0..4].copy_from_slice(&0x5800_0050u32.to_le_bytes());
    code[4..8].copy_from_slice(&0xD61F_0200u32.to_le_bytes());
    code[8..16].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Forward and backward branches encode the word offset in imm26
    fn test_make_b() {
        assert_eq!(make_b(0x1000, 0x1100), Ok(0x1400_0040));
        assert_eq!(make_b(0x1100, 0x1000), Ok(0x17FF_FFC0));
        assert_eq!(make_b(0x1000, 0x1000), Ok(0x1400_0000));
    }

    #[test]
    /// Branch limits are +128 MiB exclusive and -128 MiB inclusive
    fn test_range() {
        let base = 0x4000_0000usize;
        assert!(make_b(base, base + BRANCH_RANGE - 4).is_ok());
        assert_eq!(
            make_b(base, base + BRANCH_RANGE),
            Err(EncodeError::OutOfRange {
                from: base,
                to: base + BRANCH_RANGE
            })
        );
        assert!(make_b(base, base - BRANCH_RANGE).is_ok());
        assert!(make_b(base, base - BRANCH_RANGE - 4).is_err());
    }

    #[test]
    /// Misaligned endpoints are rejected instead of silently truncated
    fn test_misaligned() {
        assert!(matches!(
            make_b(0x1002, 0x2000),
            Err(EncodeError::Misaligned { .. })
        ));
        assert!(matches!(
            make_b(0x1000, 0x2001),
            Err(EncodeError::Misaligned { .. })
        ));
    }

    #[test]
    /// Encoded branches are recognized and decode back to their destination
    fn test_is_insn_b() {
        let insn = make_b(0x8000, 0x4000).unwrap();
        assert!(is_insn_b(insn));
        assert!(!is_insn_bl(insn));
        assert_eq!(branch_target(0x8000, insn), 0x4000);

        assert!(!is_insn_b(NOP));
        assert!(!is_insn_b(FILLER));
        // stp x29, x30, [sp, #-16]!
        assert!(!is_insn_b(0xA9BF_7BFD));
        // bl #0
        assert!(is_insn_bl(0x9400_0000));
        assert!(!is_insn_b(0x9400_0000));
    }

    #[test]
    /// Far destinations go through the veneer, and fail without one
    fn test_make_jump_insn_plt() {
        let from = 0x1_0000_0000usize;
        let far = from + 4 * BRANCH_RANGE;
        let plt = from + 0x1000;

        assert_eq!(make_jump_insn(from, from + 0x40, None), Ok(0x1400_0010));
        assert_eq!(make_jump_insn(from, far, Some(plt)), make_b(from, plt));
        assert_eq!(
            make_jump_insn(from, far, None),
            Err(EncodeError::OutOfRange { from, to: far })
        );
    }

    #[test]
    /// The veneer loads its literal into x16 and branches to it
    fn test_veneer() {
        let code = veneer(0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(u32::from_le_bytes(code[0..4].try_into().unwrap()), 0x5800_0050);
        assert_eq!(u32::from_le_bytes(code[4..8].try_into().unwrap()), 0xD61F_0200);
        assert_eq!(
            u64::from_le_bytes(code[8..16].try_into().unwrap()),
            0xDEAD_BEEF_CAFE_BABE
        );
    }
}
