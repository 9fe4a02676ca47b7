//! An owned block of wire-format laser points and its associated point rate.

use crate::protocol::{DacPoint, POINT_BYTES};
use byteorder::{ByteOrder, LittleEndian};

/// A block of points laid out exactly as they travel on the wire, paired with
/// the rate at which the DAC should consume them.
///
/// Points are written with `set_point`, which clamps coordinates to the `i16`
/// range and colors to the `u16` range. The control and reserved fields of
/// every point are zero; the rate-change flag is applied by the stream layer
/// on the raw bytes when needed.
#[derive(Clone, Debug)]
pub struct PointBlock {
    bytes: Vec<u8>,
    rate: u32,
}

impl PointBlock {
    /// A zeroed block of `len` points to be consumed at `rate` points per
    /// second.
    pub fn new(len: usize, rate: u32) -> Self {
        PointBlock {
            bytes: vec![0u8; len * POINT_BYTES],
            rate,
        }
    }

    /// The number of points in the block.
    pub fn len(&self) -> usize {
        self.bytes.len() / POINT_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The rate at which the DAC should consume these points, in points per
    /// second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Write position and color for the point at `index`, clamping x and y to
    /// the `i16` range and r, g and b to `0..=65535`.
    pub fn set_point(&mut self, index: usize, x: i32, y: i32, r: i32, g: i32, b: i32) {
        let o = index * POINT_BYTES;
        let x = x.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        let y = y.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        let r = r.clamp(0, u16::MAX as i32) as u16;
        let g = g.clamp(0, u16::MAX as i32) as u16;
        let b = b.clamp(0, u16::MAX as i32) as u16;
        LittleEndian::write_i16(&mut self.bytes[o + 2..o + 4], x);
        LittleEndian::write_i16(&mut self.bytes[o + 4..o + 6], y);
        LittleEndian::write_u16(&mut self.bytes[o + 6..o + 8], r);
        LittleEndian::write_u16(&mut self.bytes[o + 8..o + 10], g);
        LittleEndian::write_u16(&mut self.bytes[o + 10..o + 12], b);
    }

    /// Read back the point at `index`.
    pub fn point(&self, index: usize) -> DacPoint {
        let o = index * POINT_BYTES;
        let mut bytes = [0u8; POINT_BYTES];
        bytes.copy_from_slice(&self.bytes[o..o + POINT_BYTES]);
        DacPoint::read_from(&bytes)
    }

    /// The raw bytes of `n` points starting at point `start`.
    pub(crate) fn point_bytes(&self, start: usize, n: usize) -> &[u8] {
        &self.bytes[start * POINT_BYTES..(start + n) * POINT_BYTES]
    }
}

#[cfg(test)]
mod tests {
    use super::PointBlock;
    use crate::protocol::POINT_BYTES;

    #[test]
    fn set_point_clamps_and_reads_back() {
        let mut block = PointBlock::new(2, 30_000);
        block.set_point(0, -12, 34, 1000, 0, 65_535);
        block.set_point(1, 32_768, -40_000, -2, 70_000, 123);

        let p0 = block.point(0);
        assert_eq!((p0.x, p0.y), (-12, 34));
        assert_eq!((p0.r, p0.g, p0.b), (1000, 0, 65_535));
        assert_eq!(p0.control, 0);
        assert_eq!((p0.i, p0.u1, p0.u2), (0, 0, 0));

        // Out-of-range inputs land on the nearest representable value.
        let p1 = block.point(1);
        assert_eq!((p1.x, p1.y), (32_767, -32_768));
        assert_eq!((p1.r, p1.g, p1.b), (0, 65_535, 123));
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let mut block = PointBlock::new(1, 48_000);
        block.set_point(0, 0x1234, 0, 0xabcd, 0, 0);
        let bytes = block.point_bytes(0, 1);
        assert_eq!(bytes.len(), POINT_BYTES);
        // x at point offset 2, r at point offset 6.
        assert_eq!(&bytes[2..4], &[0x34, 0x12]);
        assert_eq!(&bytes[6..8], &[0xcd, 0xab]);
    }

    #[test]
    fn rate_travels_with_the_block() {
        let block = PointBlock::new(0, 30_000);
        assert!(block.is_empty());
        assert_eq!(block.rate(), 30_000);
    }
}
