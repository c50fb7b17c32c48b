/// Inbound byte accumulator with a read cursor.
///
/// Bytes are appended at the back by the I/O side and consumed from the
/// front by the dispatcher. Consumed space is reclaimed lazily.
#[derive(Debug, Default, Clone)]
pub struct ByteQueue {
    data: Vec<u8>,
    head: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.head > 0 && self.head >= self.data.len() / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn available(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn peek(&self, len: usize) -> Option<&[u8]> {
        if self.available() < len {
            return None;
        }
        Some(&self.data[self.head..self.head + len])
    }

    pub fn peek_u16_le(&self, offset: usize) -> Option<u16> {
        read_u16_le(self.as_slice(), offset)
    }

    /// Advances the cursor. Returns false, leaving the queue untouched, when
    /// fewer than `len` bytes are buffered.
    pub fn consume(&mut self, len: usize) -> bool {
        if self.available() < len {
            return false;
        }
        self.head += len;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
        true
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }
}

pub fn read_u8(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

pub fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    let low = read_u32_le(data, offset)? as u64;
    let high = read_u32_le(data, offset + 4)? as u64;
    Some(low | (high << 32))
}

/// Packs a map cell and facing into the 3-byte wire form.
pub fn pack_position(x: u16, y: u16, dir: u8) -> [u8; 3] {
    [
        (x >> 2) as u8,
        ((x << 6) as u8) | ((y >> 4) as u8 & 0x3f),
        ((y << 4) as u8) | (dir & 0x0f),
    ]
}

pub fn unpack_position(bytes: [u8; 3]) -> (u16, u16, u8) {
    let x = ((bytes[0] as u16) << 2) | ((bytes[1] as u16) >> 6);
    let y = (((bytes[1] & 0x3f) as u16) << 4) | ((bytes[2] as u16) >> 4);
    let dir = bytes[2] & 0x0f;
    (x, y, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn queue_consumes_in_order_across_pushes() {
        let mut queue = ByteQueue::new();
        queue.push(&[0x88, 0x00, 0xe9]);
        assert_eq!(queue.peek_u16_le(0), Some(0x0088));
        assert_eq!(queue.peek(4), None);
        queue.push(&[0x03, 0x00, 0x00]);
        assert_eq!(queue.available(), 6);
        assert!(queue.consume(2));
        assert_eq!(queue.as_slice(), &[0xe9, 0x03, 0x00, 0x00]);
        assert!(!queue.consume(5));
        assert!(queue.consume(4));
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_compaction_keeps_pending_bytes() {
        let mut rng = StdRng::seed_from_u64(0x1234_5678_9abc_def0);
        let mut queue = ByteQueue::new();
        let mut expected = Vec::new();
        for _ in 0..256 {
            let len = rng.gen_range(0..32usize);
            let chunk: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
            queue.push(&chunk);
            expected.extend_from_slice(&chunk);
            let take = rng.gen_range(0..=queue.available());
            assert!(queue.consume(take));
            expected.drain(..take);
            assert_eq!(queue.as_slice(), expected.as_slice());
        }
    }

    #[test]
    fn little_endian_reads_respect_bounds() {
        let data = [0xe9, 0x03, 0x00, 0x00, 0x35];
        assert_eq!(read_u16_le(&data, 0), Some(0x03e9));
        assert_eq!(read_u32_le(&data, 0), Some(1001));
        assert_eq!(read_u32_le(&data, 2), None);
        assert_eq!(read_u8(&data, 4), Some(0x35));
        assert_eq!(read_u16_le(&data, usize::MAX), None);
    }

    #[test]
    fn position_packing_roundtrip() {
        let packed = pack_position(53, 112, 4);
        assert_eq!(packed, [0x0d, 0x47, 0x04]);
        assert_eq!(unpack_position(packed), (53, 112, 4));
        assert_eq!(unpack_position(pack_position(1023, 1023, 15)), (1023, 1023, 15));
    }
}
