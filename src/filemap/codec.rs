/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Little-endian field codec for the archive header.
use crate::error::FormatError;

pub struct HeaderSerializer {
    pub(crate) output: Vec<u8>,
}

impl HeaderSerializer {
    pub fn new() -> Self {
        Self { output: vec![] }
    }

    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.output.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    /// Overwrites four bytes written earlier.
    pub fn patch_u32(&mut self, patch_at: usize, value: u32) {
        let buf = value.to_le_bytes();
        self.output[patch_at] = buf[0];
        self.output[patch_at + 1] = buf[1];
        self.output[patch_at + 2] = buf[2];
        self.output[patch_at + 3] = buf[3];
    }

    pub fn finish(self) -> Vec<u8> {
        self.output
    }
}

impl Default for HeaderSerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked reader; every getter names the field it reads so a short
/// header is reported precisely.
pub struct HeaderDeserializer<'a> {
    reader: &'a [u8],
    pc: usize,
}

impl<'a> HeaderDeserializer<'a> {
    pub fn new(reader: &'a [u8]) -> Self {
        Self { reader, pc: 0 }
    }

    pub fn position(&self) -> usize {
        self.pc
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], FormatError> {
        let end = self
            .pc
            .checked_add(len)
            .filter(|end| *end <= self.reader.len())
            .ok_or(FormatError::Truncated(field))?;
        let bytes = &self.reader[self.pc..end];
        self.pc = end;
        Ok(bytes)
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, FormatError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn get_u32(&mut self, field: &'static str) -> Result<u32, FormatError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, field)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn get_i32(&mut self, field: &'static str) -> Result<i32, FormatError> {
        Ok(self.get_u32(field)? as i32)
    }

    pub fn get_u64(&mut self, field: &'static str) -> Result<u64, FormatError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, field)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn get_bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], FormatError> {
        self.take(len, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_and_read_back() {
        let mut ser = HeaderSerializer::new();
        ser.write_u32(0xf00b_aba2);
        let patch_at = ser.len();
        ser.write_u32(0);
        ser.write_u64(u64::MAX - 1);
        ser.write_i32(-1);
        ser.patch_u32(patch_at, 77);
        let bytes = ser.finish();

        let mut de = HeaderDeserializer::new(&bytes);
        assert_eq!(de.get_u32("magic").unwrap(), 0xf00b_aba2);
        assert_eq!(de.get_u32("crc").unwrap(), 77);
        assert_eq!(de.get_u64("x").unwrap(), u64::MAX - 1);
        assert_eq!(de.get_i32("y").unwrap(), -1);
        assert_eq!(de.get_u8("z"), Err(FormatError::Truncated("z")));
    }
}
