//! Bounds-checked emitter for A64 code
//!
//! Code is written into a plain byte buffer while tracking the runtime address (`pc`) the buffer will execute at,
//! so buffers can be built before (or without) being mapped at that address.

use thiserror::Error;

use super::INSN_SIZE;

/// General purpose registers, numbered as in the encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    /// Intra-procedure-call scratch register 0
    X16 = 16,
    /// Intra-procedure-call scratch register 1
    X17 = 17,
}

/// Errors while emitting code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The buffer has no room left for the write
    #[error("code buffer overflow at offset {offset} (need {needed} bytes, have {capacity})")]
    Overflow {
        /// Offset of the failed write
        offset: usize,
        /// Bytes the write needed
        needed: usize,
        /// Total size of the buffer
        capacity: usize,
    },
}

/// Sequential writer over a code buffer
pub struct CodeWriter<'a> {
    /// Destination buffer
    buf: &'a mut [u8],
    /// Current write offset within `buf`
    offset: usize,
    /// Runtime address of `buf[0]`
    base: u64,
}

impl<'a> CodeWriter<'a> {
    /// Creates a writer for `buf`, which will execute at `base`
    pub fn new(buf: &'a mut [u8], base: u64) -> Self {
        Self {
            buf,
            offset: 0,
            base,
        }
    }

    /// Creates a writer positioned at `offset` within `buf`
    pub fn at(buf: &'a mut [u8], base: u64, offset: usize) -> Self {
        Self { buf, offset, base }
    }

    /// Runtime address of the next write
    pub fn pc(&self) -> u64 {
        self.base.wrapping_add(self.offset as u64)
    }

    /// Offset of the next write within the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reserves `len` bytes and returns them
    fn reserve(&mut self, len: usize) -> Result<&mut [u8], WriteError> {
        let start = self.offset;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(WriteError::Overflow {
                offset: start,
                needed: len,
                capacity: self.buf.len(),
            })?;
        self.offset = end;
        Ok(&mut self.buf[start..end])
    }

    /// Emits a raw instruction word
    pub fn put_u32(&mut self, insn: u32) -> Result<(), WriteError> {
        self.reserve(INSN_SIZE)?
            .copy_from_slice(&insn.to_le_bytes());
        Ok(())
    }

    /// Emits a raw 64-bit literal
    pub fn put_u64(&mut self, value: u64) -> Result<(), WriteError> {
        self.reserve(8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// `B target`. Only used for short hops inside the buffer, so the offset is not range checked
    pub fn put_b_imm(&mut self, target: u64) -> Result<(), WriteError> {
        let imm = (target as i64).wrapping_sub(self.pc() as i64) >> 2;
        self.put_u32(0x1400_0000 | (imm as u32 & 0x03FF_FFFF))
    }

    /// `BR reg`
    pub fn put_br_reg(&mut self, reg: Reg) -> Result<(), WriteError> {
        self.put_u32(0xD61F_0000 | ((reg as u32) << 5))
    }

    /// Loads `addr` into `reg` and branches to it:
    ///
    /// ```text
    /// LDR reg, #8
    /// BR  reg
    /// .quad addr
    /// ```
    pub fn put_ldr_br_address(&mut self, reg: Reg, addr: u64) -> Result<(), WriteError> {
        self.put_u32(0x5800_0000 | (2 << 5) | reg as u32)?;
        self.put_br_reg(reg)?;
        self.put_u64(addr)
    }

    /// Loads `addr` into register number `rt` and continues after the literal:
    ///
    /// ```text
    /// LDR rt, #8
    /// B   #12
    /// .quad addr
    /// ```
    pub fn put_ldr_reg_address(&mut self, rt: u32, addr: u64) -> Result<(), WriteError> {
        self.put_u32(0x5800_0000 | (2 << 5) | (rt & 0x1F))?;
        let after = self.pc() + 12;
        self.put_b_imm(after)?;
        self.put_u64(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reads back the word at `offset`
    fn word(buf: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    /// Branches are relative to the runtime address, not the buffer address
    fn test_b_imm() {
        let mut buf = [0u8; 8];
        let mut writer = CodeWriter::new(&mut buf, 0x1000);
        writer.put_u32(0).unwrap();
        writer.put_b_imm(0x1100).unwrap();
        assert_eq!(writer.pc(), 0x1008);
        // (0x1100 - 0x1004) / 4
        assert_eq!(word(&buf, 4), 0x1400_003F);
    }

    #[test]
    /// Literal load + branch sequence
    fn test_ldr_br_address() {
        let mut buf = [0u8; 16];
        let mut writer = CodeWriter::new(&mut buf, 0x1000);
        writer
            .put_ldr_br_address(Reg::X16, 0xDEAD_BEEF_CAFE_BABE)
            .unwrap();
        assert_eq!(word(&buf, 0), 0x5800_0050);
        assert_eq!(word(&buf, 4), 0xD61F_0200);
        assert_eq!(
            u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            0xDEAD_BEEF_CAFE_BABE
        );
    }

    #[test]
    /// Literal load skips over its own literal
    fn test_ldr_reg_address() {
        let mut buf = [0u8; 16];
        let mut writer = CodeWriter::new(&mut buf, 0x1000);
        writer.put_ldr_reg_address(17, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(word(&buf, 0), 0x5800_0051);
        // B from 0x1004 to 0x1010
        assert_eq!(word(&buf, 4), 0x1400_0003);
    }

    #[test]
    /// Writes past the end fail without touching the buffer
    fn test_overflow() {
        let mut buf = [0u8; 6];
        let mut writer = CodeWriter::at(&mut buf, 0x1000, 4);
        assert_eq!(
            writer.put_u32(0xFFFF_FFFF),
            Err(WriteError::Overflow {
                offset: 4,
                needed: 4,
                capacity: 6
            })
        );
        assert_eq!(writer.offset(), 4);
        assert_eq!(buf, [0u8; 6]);
    }
}
