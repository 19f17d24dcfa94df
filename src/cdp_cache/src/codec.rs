//! Byte-level encoding shared by persisted keys and values.
//!
//! Integers use the MSB base-128 VARINT of Bitcoin-derived ledgers: every byte
//! but the last has its high bit set, and each continuation adds one to the
//! accumulated value so that no two encodings denote the same number.

use crate::CdpError;

pub fn write_varint(buf: &mut Vec<u8>, mut n: u64) {
    let mut tmp = [0u8; 10];
    let mut len = 0;
    loop {
        tmp[len] = (n & 0x7f) as u8 | if len > 0 { 0x80 } else { 0x00 };
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
        len += 1;
    }
    buf.extend(tmp[..=len].iter().rev());
}

/// Cursor over an encoded buffer.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, CdpError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| CdpError::Decode("unexpected end of input".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CdpError> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            CdpError::Decode(format!("expected {} bytes at offset {}", N, self.pos))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn read_varint(&mut self) -> Result<u64, CdpError> {
        let mut n: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            if n > (u64::MAX >> 7) {
                return Err(CdpError::Decode("varint overflows u64".to_string()));
            }
            n = (n << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            n = n
                .checked_add(1)
                .ok_or_else(|| CdpError::Decode("varint overflows u64".to_string()))?;
        }
    }

    pub fn read_varint_u32(&mut self) -> Result<u32, CdpError> {
        let n = self.read_varint()?;
        u32::try_from(n).map_err(|_| CdpError::Decode(format!("{} does not fit in u32", n)))
    }

    pub fn read_varint_u16(&mut self) -> Result<u16, CdpError> {
        let n = self.read_varint()?;
        u16::try_from(n).map_err(|_| CdpError::Decode(format!("{} does not fit in u16", n)))
    }

    /// Fails when bytes remain after a complete value.
    pub fn finish(self) -> Result<(), CdpError> {
        if self.pos != self.bytes.len() {
            return Err(CdpError::Decode(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}
