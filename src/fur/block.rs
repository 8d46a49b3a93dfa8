//! Tagged, length-prefixed block serialization
//!
//! Top-level blocks carry a 4-byte tag and a 32-bit length; instrument features
//! carry a 2-byte tag and a 16-bit length. All integers are little-endian.

/// Byte buffer for one block body
#[derive(Debug, Clone, Default)]
pub struct BlockWriter {
    data: Vec<u8>,
}

impl BlockWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Write a NUL-terminated string
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Wrap the body as a top-level block
    pub fn finish_block(&self, tag: &[u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Wrap the body as an instrument feature
    pub fn finish_feature(&self, tag: &[u8; 2]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Split a concatenation of top-level blocks into `(tag, body)` pairs
pub fn split_blocks(mut data: &[u8]) -> Vec<([u8; 4], &[u8])> {
    let mut blocks = Vec::new();
    while data.len() >= 8 {
        let tag = [data[0], data[1], data[2], data[3]];
        let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let Some(body) = data.get(8..8 + len) else {
            break;
        };
        blocks.push((tag, body));
        data = &data[8 + len..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_header() {
        let mut body = BlockWriter::new();
        body.write_u8(1).write_u16(0x0302).write_str("ab");
        let block = body.finish_block(b"TEST");
        assert_eq!(block, b"TEST\x06\x00\x00\x00\x01\x02\x03ab\x00");
    }

    #[test]
    fn test_feature_header() {
        let mut body = BlockWriter::new();
        body.write_u32(0xAABBCCDD);
        assert_eq!(body.finish_feature(b"FM"), b"FM\x04\x00\xDD\xCC\xBB\xAA");
    }

    #[test]
    fn test_split_blocks() {
        let mut data = BlockWriter::new().write_u8(9).finish_block(b"AAAA");
        data.extend(BlockWriter::new().finish_block(b"BBBB"));
        data.extend_from_slice(b"CC");
        let blocks = split_blocks(&data);
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[0].0, b"AAAA");
        assert_eq!(blocks[0].1, &[9]);
        assert!(blocks[1].1.is_empty());
    }
}
