//! Little-endian byte encoding shared by class files and archives

/// Errors that can occur while decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Unknown tag byte
    #[error("Invalid tag {tag} at offset {offset}")]
    InvalidTag {
        /// Tag found
        tag: u8,
        /// Where it was found
        offset: usize,
    },
}

/// Byte writer
#[derive(Debug, Default)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Current length
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Write a byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Write a u16
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u32
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u64
    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an i64
    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Write a length-prefixed byte string
    pub fn emit_blob(&mut self, bytes: &[u8]) {
        self.emit_u32(bytes.len() as u32);
        self.emit_bytes(bytes);
    }

    /// Write a length-prefixed UTF-8 string
    pub fn emit_str(&mut self, value: &str) {
        self.emit_blob(value.as_bytes());
    }
}

/// Byte reader
#[derive(Debug)]
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader over `buffer`
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Read `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a u16
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a u32
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a u64
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read an i64
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read a length-prefixed byte string
    pub fn read_blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let start = self.position;
        let bytes = self.read_blob()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_truncation() {
        let mut writer = ByteWriter::new();
        writer.emit_u32(7);
        writer.emit_str("halyard");
        let bytes = writer.into_bytes();

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_string().unwrap(), "halyard");
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.read_u8(), Err(DecodeError::UnexpectedEnd(15)));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut writer = ByteWriter::new();
        writer.emit_blob(&[0xff, 0xfe]);
        let bytes = writer.into_bytes();
        assert_eq!(
            ByteReader::new(&bytes).read_string(),
            Err(DecodeError::InvalidUtf8(0))
        );
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut writer = ByteWriter::new();
        writer.emit_u32(u32::MAX);
        let bytes = writer.into_bytes();
        assert!(ByteReader::new(&bytes).read_blob().is_err());
    }
}
