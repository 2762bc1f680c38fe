use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::*;

/// # III.D Disk Format: Level 1D - Local Heaps
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 4           | Signature `HEAP` |
/// | 1           | Version (0) |
/// | 3           | Reserved |
/// | length-size | Data segment size |
/// | length-size | Offset to head of free list |
/// | offset-size | Address of data segment |
///
/// Classic groups store their link names here; symbol table entries carry
/// byte offsets into the data segment, each naming a NUL-terminated string.
/// The segment is materialized once per heap and indexed in memory.
pub struct LocalHeap {
    pub data_segment_size: u64,
    pub data_address: u64,
    data: Vec<u8>,
}

const LOCAL_HEAP_SIGNATURE: &[u8; 4] = b"HEAP";

impl LocalHeap {
    pub fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<LocalHeap> {
        let header_len = 8 + 2 * ctx.length_size as usize + ctx.offset_size as usize;
        let mut block = channel.read_block(address, header_len)?;
        let mut signature = [0u8; 4];
        block.read_exact(&mut signature)?;
        if &signature != LOCAL_HEAP_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no HEAP signature at {address:#x}"
            )));
        }
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "local heap",
                version,
            });
        }
        block.skip_bytes(3)?;
        let data_segment_size = block.read_sized(ctx.length_size)?;
        let _free_list_head = block.read_sized(ctx.length_size)?;
        let data_address = block
            .read_offset(ctx.offset_size)?
            .ok_or_else(|| HdfError::CorruptFile("local heap data segment undefined".into()))?;

        let data = channel
            .read_block(data_address, data_segment_size as usize)?
            .into_inner();
        Ok(LocalHeap {
            data_segment_size,
            data_address,
            data,
        })
    }

    /// The NUL-terminated string starting at `offset` in the data segment.
    pub fn string_at(&self, offset: u64) -> Result<&str> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Err(HdfError::CorruptFile(format!(
                "local heap offset {offset} beyond segment of {} bytes",
                self.data.len()
            )));
        }
        let tail = &self.data[start..];
        let end = tail.iter().position(|b| *b == 0).ok_or_else(|| {
            HdfError::CorruptFile(format!("unterminated name at heap offset {offset}"))
        })?;
        std::str::from_utf8(&tail[..end])
            .map_err(|e| HdfError::CorruptFile(format!("heap name is not UTF-8: {e}")))
    }
}

/// # III.E Disk Format: Level 1E - Global Heap
///
/// A collection is a 16-byte-aligned block of length-tagged objects:
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 4           | Signature `GCOL` |
/// | 1           | Version (1) |
/// | 3           | Reserved |
/// | length-size | Collection size, header included |
/// | -           | Objects |
///
/// Each object: heap object index (2), reference count (2), reserved (4),
/// object size (length-size), data, padding to a multiple of 8. Object
/// index 0 describes the remaining free space and terminates the scan.
pub struct GlobalHeapCollection {
    pub address: u64,
    objects: HashMap<u16, Vec<u8>>,
}

pub const GLOBAL_HEAP_SIGNATURE: &[u8; 4] = b"GCOL";

impl GlobalHeapCollection {
    fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<GlobalHeapCollection> {
        let header_len = 8 + ctx.length_size as usize;
        let mut header = channel.read_block(address, header_len)?;
        let mut signature = [0u8; 4];
        header.read_exact(&mut signature)?;
        if &signature != GLOBAL_HEAP_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no GCOL signature at {address:#x}"
            )));
        }
        let version = header.read_u8()?;
        if version != 1 {
            return Err(HdfError::UnsupportedVersion {
                entity: "global heap collection",
                version,
            });
        }
        header.skip_bytes(3)?;
        let collection_size = header.read_sized(ctx.length_size)? as usize;
        if collection_size < header_len {
            return Err(HdfError::CorruptFile(format!(
                "global heap collection at {address:#x} smaller than its header"
            )));
        }

        let mut block = channel.read_block(address, collection_size)?;
        block.skip_bytes(header_len)?;

        let mut objects = HashMap::new();
        let object_header_len = 8 + ctx.length_size as usize;
        while collection_size as u64 - block.position() >= object_header_len as u64 {
            let index = block.read_u16::<LittleEndian>()?;
            let _reference_count = block.read_u16::<LittleEndian>()?;
            block.skip_bytes(4)?;
            let size = block.read_sized(ctx.length_size)? as usize;
            if index == 0 {
                break;
            }
            let data = block.read_bytes(size)?;
            block.skip_bytes(size.div_ceil(8) * 8 - size)?;
            objects.insert(index, data);
        }
        trace!("global heap collection at {address:#x}: {} objects", objects.len());

        Ok(GlobalHeapCollection { address, objects })
    }

    pub fn object(&self, index: u16) -> Result<&[u8]> {
        self.objects
            .get(&index)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                HdfError::CorruptFile(format!(
                    "global heap object {index} missing from collection at {:#x}",
                    self.address
                ))
            })
    }
}

/// Lazily loaded global heap collections, keyed by collection address.
///
/// A collection is loaded outside the map lock (the channel mutex
/// serializes the read) and installed under a short lock afterwards, so
/// concurrent readers either see a fully loaded collection or none.
pub struct GlobalHeap {
    collections: Mutex<HashMap<u64, Arc<GlobalHeapCollection>>>,
}

impl GlobalHeap {
    pub fn new() -> GlobalHeap {
        GlobalHeap {
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub fn collection(
        &self,
        channel: &Channel,
        ctx: &FormatContext,
        address: u64,
    ) -> Result<Arc<GlobalHeapCollection>> {
        if let Some(found) = self.collections.lock().expect("heap mutex poisoned").get(&address) {
            return Ok(Arc::clone(found));
        }
        let loaded = Arc::new(GlobalHeapCollection::read(channel, ctx, address)?);
        let mut map = self.collections.lock().expect("heap mutex poisoned");
        Ok(Arc::clone(map.entry(address).or_insert(loaded)))
    }

    /// Payload bytes of `(collection address, object index)`.
    pub fn object_bytes(
        &self,
        channel: &Channel,
        ctx: &FormatContext,
        address: u64,
        index: u16,
    ) -> Result<Vec<u8>> {
        let collection = self.collection(channel, ctx, address)?;
        Ok(collection.object(index)?.to_vec())
    }
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CTX: FormatContext = FormatContext {
        offset_size: 8,
        length_size: 8,
    };

    fn collection_image(objects: &[&[u8]]) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(GLOBAL_HEAP_SIGNATURE);
        image.push(1);
        image.extend_from_slice(&[0; 3]);
        let size_at = image.len();
        image.extend_from_slice(&0u64.to_le_bytes());
        for (i, data) in objects.iter().enumerate() {
            image.extend_from_slice(&(i as u16 + 1).to_le_bytes());
            image.extend_from_slice(&1u16.to_le_bytes());
            image.extend_from_slice(&[0; 4]);
            image.extend_from_slice(&(data.len() as u64).to_le_bytes());
            image.extend_from_slice(data);
            while image.len() % 8 != 0 {
                image.push(0);
            }
        }
        let total = image.len() as u64;
        image[size_at..size_at + 8].copy_from_slice(&total.to_le_bytes());
        image
    }

    #[test]
    fn collection_objects_by_index() {
        let channel = Channel::from_bytes(collection_image(&[b"hello", b"global heap"]));
        let heap = GlobalHeap::new();
        assert_eq!(heap.object_bytes(&channel, &CTX, 0, 1).unwrap(), b"hello");
        assert_eq!(
            heap.object_bytes(&channel, &CTX, 0, 2).unwrap(),
            b"global heap"
        );
        assert!(matches!(
            heap.object_bytes(&channel, &CTX, 0, 9),
            Err(HdfError::CorruptFile(_))
        ));
    }

    #[test]
    fn collection_loaded_once() {
        let channel = Channel::from_bytes(collection_image(&[b"x"]));
        let heap = GlobalHeap::new();
        let first = heap.collection(&channel, &CTX, 0).unwrap();
        let second = heap.collection(&channel, &CTX, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn local_heap_strings() {
        let mut image = Vec::new();
        image.extend_from_slice(b"HEAP");
        image.push(0);
        image.extend_from_slice(&[0; 3]);
        image.extend_from_slice(&16u64.to_le_bytes()); // segment size
        image.extend_from_slice(&0u64.to_le_bytes()); // free list
        let data_at = (8 + 16 + 8) as u64;
        image.extend_from_slice(&data_at.to_le_bytes());
        image.extend_from_slice(b"\0integer\0\0\0\0\0\0\0\0");
        let channel = Channel::from_bytes(image);
        let heap = LocalHeap::read(&channel, &CTX, 0).unwrap();
        assert_eq!(heap.string_at(1).unwrap(), "integer");
        assert!(heap.string_at(64).is_err());
    }
}
