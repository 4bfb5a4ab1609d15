use super::{Addr, ByteOrder, SIZEOF_MAGIC};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};

/// Bounds checked reader over a metadata image.
///
/// Every accessor checks that enough bytes remain before touching the buffer and fails with
/// [`MetadataError::BufferOverflow`] otherwise. The cursor never advances on failure.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    config: &'a FileConfig,
}

impl<'a> Decoder<'a> {
    /// Start decoding at the beginning of `buf`.
    pub fn new(buf: &'a [u8], config: &'a FileConfig) -> Self {
        Self {
            buf,
            pos: 0,
            config,
        }
    }

    /// Current offset into the image.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Configuration this decoder honours.
    pub fn config(&self) -> &'a FileConfig {
        self.config
    }

    /// Fail unless at least `need` bytes remain.
    pub fn ensure(&self, need: usize) -> Result<()> {
        if need > self.remaining() {
            Err(MetadataError::BufferOverflow {
                offset: self.pos,
                need,
                len: self.buf.len(),
            })
        } else {
            Ok(())
        }
    }

    /// Take the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Move to an absolute offset within the image.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(MetadataError::BufferOverflow {
                offset: self.pos,
                need: pos - self.pos.min(pos),
                len: self.buf.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Check a 4 byte signature.
    pub fn signature(&mut self, magic: &[u8; SIZEOF_MAGIC], what: &'static str) -> Result<()> {
        if self.bytes(SIZEOF_MAGIC)? != magic {
            return Err(MetadataError::BadSignature(what));
        }
        Ok(())
    }

    /// Read a byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Read a 16 bit integer in file byte order.
    pub fn u16(&mut self) -> Result<u16> {
        self.uint(2).map(|v| v as u16)
    }

    /// Read a 32 bit integer in file byte order.
    pub fn u32(&mut self) -> Result<u32> {
        self.uint(4).map(|v| v as u32)
    }

    /// Read a 64 bit integer in file byte order.
    pub fn u64(&mut self) -> Result<u64> {
        self.uint(8)
    }

    /// Read a 32 bit integer which is always big-endian, whatever the file byte order.
    pub fn u32_be(&mut self) -> Result<u32> {
        let raw = self.bytes(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read an unsigned integer `width` bytes wide (at most 8) in file byte order.
    pub fn uint(&mut self, width: usize) -> Result<u64> {
        debug_assert!(width <= 8);
        let raw = self.bytes(width)?;
        Ok(decode_uint(raw, self.config.byte_order))
    }

    /// Read a file address. All 0xff bytes decode to [`Addr::UNDEF`].
    pub fn addr(&mut self) -> Result<Addr> {
        let raw = self.bytes(self.config.sizeof_addr())?;
        if raw.iter().all(|b| *b == 0xff) {
            return Ok(Addr::UNDEF);
        }
        Ok(Addr::new(decode_uint(raw, self.config.byte_order)))
    }

    /// Read a length.
    pub fn length(&mut self) -> Result<u64> {
        self.uint(self.config.sizeof_size())
    }
}

/// Bounds checked writer into a metadata image.
///
/// The buffer is sized by the caller (usually from a client's image length). Writing past its
/// end fails with [`MetadataError::BufferOverflow`].
#[derive(Debug)]
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
    config: &'a FileConfig,
}

impl<'a> Encoder<'a> {
    /// Start encoding at the beginning of `buf`.
    pub fn new(buf: &'a mut [u8], config: &'a FileConfig) -> Self {
        Self {
            buf,
            pos: 0,
            config,
        }
    }

    /// Current offset into the image.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to write.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Configuration this encoder honours.
    pub fn config(&self) -> &'a FileConfig {
        self.config
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.remaining() {
            return Err(MetadataError::BufferOverflow {
                offset: self.pos,
                need: n,
                len: self.buf.len(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..start + n])
    }

    /// Write raw bytes.
    pub fn bytes(&mut self, src: &[u8]) -> Result<()> {
        self.reserve(src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Write `n` zero bytes.
    pub fn zeros(&mut self, n: usize) -> Result<()> {
        self.reserve(n)?.fill(0);
        Ok(())
    }

    /// Zero everything from the cursor to the end of the image.
    pub fn zero_fill(&mut self) {
        self.buf[self.pos..].fill(0);
        self.pos = self.buf.len();
    }

    /// Write a byte.
    pub fn u8(&mut self, value: u8) -> Result<()> {
        self.bytes(&[value])
    }

    /// Write a 16 bit integer in file byte order.
    pub fn u16(&mut self, value: u16) -> Result<()> {
        self.uint(value as u64, 2)
    }

    /// Write a 32 bit integer in file byte order.
    pub fn u32(&mut self, value: u32) -> Result<()> {
        self.uint(value as u64, 4)
    }

    /// Write a 64 bit integer in file byte order.
    pub fn u64(&mut self, value: u64) -> Result<()> {
        self.uint(value, 8)
    }

    /// Write a 32 bit integer big-endian, whatever the file byte order.
    pub fn u32_be(&mut self, value: u32) -> Result<()> {
        self.bytes(&value.to_be_bytes())
    }

    /// Write `value` as an unsigned integer `width` bytes wide in file byte order.
    pub fn uint(&mut self, value: u64, width: usize) -> Result<()> {
        debug_assert!(width <= 8);
        if width < 8 && value >> (width * 8) != 0 {
            return Err(MetadataError::bad_value(format!(
                "{value} does not fit in {width} bytes"
            )));
        }
        let order = self.config.byte_order;
        encode_uint(self.reserve(width)?, value, order);
        Ok(())
    }

    /// Write a file address. [`Addr::UNDEF`] encodes as all 0xff bytes.
    pub fn addr(&mut self, addr: Addr) -> Result<()> {
        let width = self.config.sizeof_addr();
        if addr.is_defined() {
            self.uint(addr.value(), width)
        } else {
            self.reserve(width)?.fill(0xff);
            Ok(())
        }
    }

    /// Write a length.
    pub fn length(&mut self, value: u64) -> Result<()> {
        self.uint(value, self.config.sizeof_size())
    }
}

fn decode_uint(raw: &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Little => raw
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64),
        ByteOrder::Big => raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64),
    }
}

fn encode_uint(dst: &mut [u8], mut value: u64, order: ByteOrder) {
    let width = dst.len();
    for i in 0..width {
        let b = (value & 0xff) as u8;
        value >>= 8;
        match order {
            ByteOrder::Little => dst[i] = b,
            ByteOrder::Big => dst[width - 1 - i] = b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrow_big() -> FileConfig {
        FileConfig {
            sizeof_addr: 4,
            sizeof_size: 2,
            byte_order: ByteOrder::Big,
            ..Default::default()
        }
    }

    #[test]
    fn it_reads_in_file_byte_order() {
        let config = FileConfig::default();
        let buf = [0x01, 0x02, 0x03, 0x04];
        let mut dec = Decoder::new(&buf, &config);
        assert_eq!(dec.u32().expect("reads"), 0x0403_0201);

        let config = narrow_big();
        let mut dec = Decoder::new(&buf, &config);
        assert_eq!(dec.u32().expect("reads"), 0x0102_0304);
    }

    #[test]
    fn it_reads_big_endian_regardless() {
        let config = FileConfig::default();
        let buf = [0x3b, 0x9a, 0xca, 0x00];
        let mut dec = Decoder::new(&buf, &config);
        assert_eq!(dec.u32_be().expect("reads"), 1_000_000_000);
    }

    #[test]
    fn it_decodes_undefined_address() {
        let config = narrow_big();
        let buf = [0xff; 4];
        let mut dec = Decoder::new(&buf, &config);
        assert_eq!(dec.addr().expect("reads"), Addr::UNDEF);
    }

    #[test]
    fn it_refuses_to_overrun() {
        let config = FileConfig::default();
        let buf = [0u8; 7];
        let mut dec = Decoder::new(&buf, &config);
        dec.skip(2).expect("skips");
        match dec.addr() {
            Err(MetadataError::BufferOverflow { offset, need, len }) => {
                assert_eq!((offset, need, len), (2, 8, 7));
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        // cursor unchanged after failure
        assert_eq!(dec.position(), 2);
    }

    #[test]
    fn it_writes_addresses_at_file_width() {
        let config = narrow_big();
        let mut buf = [0u8; 10];
        let mut enc = Encoder::new(&mut buf, &config);
        enc.addr(Addr::new(0x0a0b)).expect("writes");
        enc.addr(Addr::UNDEF).expect("writes");
        enc.length(0x1234).expect("writes");
        assert_eq!(
            buf,
            [0x00, 0x00, 0x0a, 0x0b, 0xff, 0xff, 0xff, 0xff, 0x12, 0x34]
        );
    }

    #[test]
    fn it_rejects_values_too_wide() {
        let config = narrow_big();
        let mut buf = [0u8; 2];
        let mut enc = Encoder::new(&mut buf, &config);
        assert!(matches!(
            enc.length(0x1_0000),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_zero_fills_tail() {
        let config = FileConfig::default();
        let mut buf = [0xaau8; 8];
        let mut enc = Encoder::new(&mut buf, &config);
        enc.u16(7).expect("writes");
        enc.zero_fill();
        assert_eq!(buf, [7, 0, 0, 0, 0, 0, 0, 0]);
    }
}
