use crate::error::VmError;
use byteorder::{BigEndian, ByteOrder};

/// Big-endian reader over the raw bytes of a class file.
pub struct ClassFileCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ClassFileCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    fn truncated() -> VmError {
        VmError::NoClassDefFound("class file is truncated".to_string())
    }

    pub fn u1(&mut self) -> Result<u8, VmError> {
        let byte = *self.data.get(self.pos).ok_or_else(Self::truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn u2(&mut self) -> Result<u16, VmError> {
        let end = self.pos + 2;
        if end > self.data.len() {
            return Err(Self::truncated());
        }
        let value = BigEndian::read_u16(&self.data[self.pos..end]);
        self.pos = end;
        Ok(value)
    }

    pub fn u4(&mut self) -> Result<u32, VmError> {
        let end = self.pos + 4;
        if end > self.data.len() {
            return Err(Self::truncated());
        }
        let value = BigEndian::read_u32(&self.data[self.pos..end]);
        self.pos = end;
        Ok(value)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], VmError> {
        let end = self.pos.checked_add(len).ok_or_else(Self::truncated)?;
        if end > self.data.len() {
            return Err(Self::truncated());
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), VmError> {
        let end = self.pos.checked_add(len).ok_or_else(Self::truncated)?;
        if end > self.data.len() {
            return Err(Self::truncated());
        }
        self.pos = end;
        Ok(())
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}
