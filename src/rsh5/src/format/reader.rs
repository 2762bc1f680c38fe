use std::fs::File;
use std::io::BufReader;
use std::sync::Mutex;

use super::*;

/// Any seekable byte source the file can be opened over.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Padding after a NUL-terminated name to the next 8-byte boundary,
/// counting the terminator itself.
pub(crate) fn name_padding(len: usize) -> usize {
    (8 - ((len + 1) % 8)) % 8
}

/// Primitive reads shared by every decoder in the crate.
///
/// Multi-byte integers are little-endian unless a decoder asks for
/// big-endian explicitly through [`byteorder`]; offsets and lengths are
/// routed through the fixed-point engine so that the superblock's
/// size-of-offsets / size-of-lengths parameterize every address read the
/// same way.
pub(crate) trait ReaderExt: Read {
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; n];
        self.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn skip_bytes(&mut self, n: usize) -> Result<()> {
        let mut buffer = vec![0u8; n];
        self.read_exact(&mut buffer)?;
        Ok(())
    }

    /// Reads until the first 0x00 byte, which is consumed and dropped.
    fn read_null_terminated_string(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        String::from_utf8(bytes)
            .map_err(|e| HdfError::CorruptFile(format!("name is not valid UTF-8: {e}")))
    }

    /// A NUL-terminated name padded to the next 8-byte boundary, as object
    /// header messages store them.
    fn read_padded_name(&mut self) -> Result<String> {
        let name = self.read_null_terminated_string()?;
        self.skip_bytes(name_padding(name.len()))?;
        Ok(name)
    }

    /// A file offset of `size` bytes. All-0xff is the undefined-address
    /// sentinel and decodes to `None`.
    fn read_offset(&mut self, size: u8) -> Result<Option<u64>> {
        let bytes = self.read_bytes(size as usize)?;
        let value = FixedPointValue::new(bytes, FixedPointSpec::address(size))?;
        if value.is_undefined() {
            return Ok(None);
        }
        Ok(Some(value.to_u64()?))
    }

    /// A file length of `size` bytes; lengths have no undefined sentinel.
    fn read_sized(&mut self, size: u8) -> Result<u64> {
        let bytes = self.read_bytes(size as usize)?;
        FixedPointValue::new(bytes, FixedPointSpec::address(size))?.to_u64()
    }
}

impl<R: Read> ReaderExt for R {}

/// The shared byte channel of one open file.
///
/// Every read is a single `seek` + `read_exact` pair under the mutex, per
/// the locking model: one contiguous read per lock hold, nothing retained
/// between holds. Decoders pull whole structures into an in-memory
/// [`Block`] and parse from there, so the lock is never held across
/// structural decoding.
pub struct Channel {
    inner: Mutex<Box<dyn ReadSeek>>,
}

impl Channel {
    pub fn new(source: Box<dyn ReadSeek>) -> Channel {
        Channel {
            inner: Mutex::new(source),
        }
    }

    pub fn open(path: &std::path::Path) -> Result<Channel> {
        let file = File::open(path)?;
        Ok(Channel::new(Box::new(BufReader::new(file))))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Channel {
        Channel::new(Box::new(Cursor::new(bytes)))
    }

    pub fn read_exact_at(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        inner.seek(SeekFrom::Start(address))?;
        inner.read_exact(buffer)?;
        Ok(())
    }

    /// Pulls `length` bytes at `address` into an in-memory block.
    pub fn read_block(&self, address: u64, length: usize) -> Result<Block> {
        let mut buffer = vec![0u8; length];
        self.read_exact_at(address, &mut buffer)?;
        Ok(Cursor::new(buffer))
    }

    /// Like [`Channel::read_block`] but tolerates a short read at the end
    /// of the channel, returning whatever was available.
    pub fn read_block_at_most(&self, address: u64, length: usize) -> Result<Block> {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        inner.seek(SeekFrom::Start(address))?;
        let mut buffer = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = inner.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(Cursor::new(buffer))
    }

    pub fn size(&self) -> Result<u64> {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        Ok(inner.seek(SeekFrom::End(0))?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_padding_boundaries() {
        // len + terminator rounded up to 8
        assert_eq!(name_padding(0), 7);
        assert_eq!(name_padding(7), 0);
        assert_eq!(name_padding(8), 7);
        assert_eq!(name_padding(3), 4);
    }

    #[test]
    fn padded_name_consumes_to_boundary() {
        let mut block = Cursor::new(b"abc\0\0\0\0\0xyz".to_vec());
        assert_eq!(block.read_padded_name().unwrap(), "abc");
        assert_eq!(block.position(), 8);
    }

    #[test]
    fn offset_undefined_sentinel() {
        let mut block = Cursor::new(vec![0xff, 0xff, 0xff, 0xff]);
        assert_eq!(block.read_offset(4).unwrap(), None);
        let mut block = Cursor::new(vec![0x10, 0x02, 0x00, 0x00]);
        assert_eq!(block.read_offset(4).unwrap(), Some(0x210));
    }

    #[test]
    fn short_read_is_unexpected_eof() {
        let channel = Channel::from_bytes(vec![1, 2, 3]);
        let err = channel.read_block(0, 8).unwrap_err();
        match err {
            HdfError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }
}
