//! # Trampoline
//!
//! Builds the code a hooked function jumps to. A trampoline is a copy of a fixed template whose data slots are
//! filled in from a table of `{offset, kind, width}` descriptors, followed by the relocated entry instruction.
//!
//! The function template saves the frame and argument registers, calls the handler and inspects its verdict:
//!
//! ```text
//!   0  stp  x29, x30, [sp, #-16]!
//!   4  mov  x29, sp
//!   8  stp  x0, x1, [sp, #-16]!        ; x2..x7 likewise up to 20
//!  24  ldr  x16, handler
//!  28  blr  x16
//!  32  cbnz x0, block
//!  36  ldp  x6, x7, [sp], #16          ; restore everything down to 52
//!  56  <displaced instruction>
//!  60  ldr  x16, resume
//!  64  br   x16
//!  68  block: mov x1, x0
//!  72  str  x0, [sp, #48]             ; saved x0 becomes the verdict
//!  76  ldr  x0, owner
//!  80  ldr  x16, logger
//!  84  blr  x16
//!  88  ldp  x6, x7, [sp], #16          ; restore down to 104
//! 108  ret
//! 112  .quad handler, resume, owner, logger
//! 144  relocation tail
//! ```

use crate::code::arm64::relocator::{relocate_insn, RelocSite, RelocateError};
use crate::code::arm64::writer::{CodeWriter, WriteError};
use crate::code::arm64::{FILLER, INSN_SIZE, UNPATCHED};
use crate::insn::CodeSlot;

/// Size allocated for every trampoline, template and relocation tail included
pub const TRAMPOLINE_SIZE: usize = 256;

/// What a template slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Address of the operator's handler
    Handler,
    /// Address execution continues at after the displaced instruction, `target + 4`
    Resume,
    /// Context pointer of the hook's owner, passed to the logger
    Owner,
    /// Address of the attack logging sink
    Logger,
    /// The displaced instruction. Filled with a no-op, then overwritten by relocation.
    Displaced,
}

/// How many bytes a slot spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWidth {
    /// One instruction word
    Word,
    /// A 64-bit literal
    Quad,
}

impl SlotWidth {
    /// Width in bytes
    pub fn bytes(self) -> usize {
        match self {
            Self::Word => INSN_SIZE,
            Self::Quad => 8,
        }
    }
}

/// A patchable location inside a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDesc {
    /// Byte offset from the start of the template
    pub offset: usize,
    /// What gets written
    pub kind: SlotKind,
    /// How much gets written
    pub width: SlotWidth,
}

/// A code template with its slot table
#[derive(Debug)]
pub struct Template {
    /// Instruction words and zeroed literal pool
    pub words: &'static [u32],
    /// Slots to fill in after copying `words`
    pub slots: &'static [SlotDesc],
    /// Where the displaced instruction and its relocation tail go
    pub site: RelocSite,
}

impl Template {
    /// Size of the template in bytes
    pub fn len(&self) -> usize {
        self.words.len() * INSN_SIZE
    }

    /// Returns true for a template without code
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Offset of the first slot of `kind`
    pub fn offset_of(&self, kind: SlotKind) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| slot.kind == kind)
            .map(|slot| slot.offset)
    }
}

/// Values written into template slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotValues {
    /// Handler address
    pub handler: usize,
    /// Resume address
    pub resume: usize,
    /// Owner context pointer
    pub owner: usize,
    /// Logger address
    pub logger: usize,
}

impl SlotValues {
    /// Value of a slot of `kind`
    fn value(&self, kind: SlotKind) -> u64 {
        match kind {
            SlotKind::Handler => self.handler as u64,
            SlotKind::Resume => self.resume as u64,
            SlotKind::Owner => self.owner as u64,
            SlotKind::Logger => self.logger as u64,
            SlotKind::Displaced => u64::from(FILLER),
        }
    }
}

/// Template shared by the pre and post function hooks
pub static FUNC_TEMPLATE: Template = Template {
    words: &[
        0xA9BF_7BFD, // stp x29, x30, [sp, #-16]!
        0x9100_03FD, // mov x29, sp
        0xA9BF_07E0, // stp x0, x1, [sp, #-16]!
        0xA9BF_0FE2, // stp x2, x3, [sp, #-16]!
        0xA9BF_17E4, // stp x4, x5, [sp, #-16]!
        0xA9BF_1FE6, // stp x6, x7, [sp, #-16]!
        0x5800_02D0, // ldr x16, handler
        0xD63F_0200, // blr x16
        0xB500_0120, // cbnz x0, block
        0xA8C1_1FE6, // ldp x6, x7, [sp], #16
        0xA8C1_17E4, // ldp x4, x5, [sp], #16
        0xA8C1_0FE2, // ldp x2, x3, [sp], #16
        0xA8C1_07E0, // ldp x0, x1, [sp], #16
        0xA8C1_7BFD, // ldp x29, x30, [sp], #16
        UNPATCHED,   // displaced instruction
        0x5800_01F0, // ldr x16, resume
        0xD61F_0200, // br x16
        0xAA00_03E1, // block: mov x1, x0
        0xF900_1BE0, // str x0, [sp, #48]
        0x5800_01A0, // ldr x0, owner
        0x5800_01D0, // ldr x16, logger
        0xD63F_0200, // blr x16
        0xA8C1_1FE6, // ldp x6, x7, [sp], #16
        0xA8C1_17E4, // ldp x4, x5, [sp], #16
        0xA8C1_0FE2, // ldp x2, x3, [sp], #16
        0xA8C1_07E0, // ldp x0, x1, [sp], #16
        0xA8C1_7BFD, // ldp x29, x30, [sp], #16
        0xD65F_03C0, // ret
        0, 0, // handler
        0, 0, // resume
        0, 0, // owner
        0, 0, // logger
    ],
    slots: &[
        SlotDesc {
            offset: 56,
            kind: SlotKind::Displaced,
            width: SlotWidth::Word,
        },
        SlotDesc {
            offset: 112,
            kind: SlotKind::Handler,
            width: SlotWidth::Quad,
        },
        SlotDesc {
            offset: 120,
            kind: SlotKind::Resume,
            width: SlotWidth::Quad,
        },
        SlotDesc {
            offset: 128,
            kind: SlotKind::Owner,
            width: SlotWidth::Quad,
        },
        SlotDesc {
            offset: 136,
            kind: SlotKind::Logger,
            width: SlotWidth::Quad,
        },
    ],
    site: RelocSite {
        slot: 56,
        tail: 144,
    },
};

/// Copies `template` into `code`, fills its slots and relocates `displaced` (taken from `target`) into it.
///
/// Returns the number of relocation tail bytes used.
pub fn build(
    template: &Template,
    code: &mut CodeSlot,
    values: &SlotValues,
    displaced: u32,
    target: usize,
) -> Result<usize, RelocateError> {
    let code_pc = code.address() as u64;
    let buf = code.bytes_mut();

    let mut writer = CodeWriter::new(buf, code_pc);
    for word in template.words {
        writer.put_u32(*word)?;
    }

    for slot in template.slots {
        let mut writer = CodeWriter::at(buf, code_pc, slot.offset);
        let value = values.value(slot.kind);
        match slot.width {
            SlotWidth::Word => writer.put_u32(value as u32)?,
            SlotWidth::Quad => writer.put_u64(value)?,
        }
    }

    relocate_insn(buf, code_pc, template.site, displaced, target as u64)
}

/// Writes `bytes` at the start of `code`
pub fn write_raw(code: &mut CodeSlot, bytes: &[u8]) -> Result<(), WriteError> {
    let capacity = code.len();
    code.bytes_mut()
        .get_mut(..bytes.len())
        .ok_or(WriteError::Overflow {
            offset: 0,
            needed: bytes.len(),
            capacity,
        })?
        .copy_from_slice(bytes);
    Ok(())
}
