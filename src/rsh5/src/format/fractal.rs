use super::*;

/// # III.F Disk Format: Level 1F - Fractal Heap
///
/// Dense groups store their link messages as managed objects in a fractal
/// heap; the name-index v2 B-tree records carry heap ids pointing back into
/// it. Only managed objects are needed for link storage, so huge and tiny
/// ids are rejected.
///
/// Header (signature `FRHP`, version 0), fields in file order:
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 2           | Heap id length |
/// | 2           | Encoded length of i/o filter information |
/// | 1           | Flags (bit 1: direct blocks are checksummed) |
/// | 4           | Maximum size of managed objects |
/// | length-size | Next huge object id |
/// | offset-size | Huge object v2 B-tree address |
/// | length-size | Amount of free space |
/// | offset-size | Free-space manager address |
/// | length-size | Amount of managed space |
/// | length-size | Amount of allocated managed space |
/// | length-size | Direct block iterator offset |
/// | length-size | Number of managed objects |
/// | length-size x 4 | Huge/tiny sizes and counts |
/// | 2           | Table width |
/// | length-size | Starting block size |
/// | length-size | Maximum direct block size |
/// | 2           | Maximum heap size (bits) |
/// | 2           | Starting number of rows in root indirect block |
/// | offset-size | Root block address |
/// | 2           | Current number of rows in root indirect block (0: the root is a direct block) |
/// | 4           | Checksum |
pub struct FractalHeap {
    pub id_length: u16,
    pub table_width: u16,
    pub starting_block_size: u64,
    pub max_direct_block_size: u64,
    pub max_heap_size_bits: u16,
    pub managed_object_count: u64,
    heap_offset_bytes: u8,
    /// Resolved direct blocks: heap-space offset, span, file address.
    blocks: Vec<DirectBlock>,
}

struct DirectBlock {
    heap_offset: u64,
    size: u64,
    address: u64,
}

const HEAP_HEADER_SIGNATURE: &[u8; 4] = b"FRHP";
const DIRECT_BLOCK_SIGNATURE: &[u8; 4] = b"FHDB";

impl FractalHeap {
    pub fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<FractalHeap> {
        let l = ctx.length_size as usize;
        let o = ctx.offset_size as usize;
        // twelve length-size fields: ten statistics plus the starting and
        // maximum direct block sizes
        let header_len = 4 + 1 + 2 + 2 + 1 + 4 + 12 * l + 2 * o + 2 + 2 + 2 + o + 2 + 4;
        let mut block = channel.read_block(address, header_len)?;

        let mut signature = [0u8; 4];
        block.read_exact(&mut signature)?;
        if &signature != HEAP_HEADER_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no FRHP signature at {address:#x}"
            )));
        }
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "fractal heap",
                version,
            });
        }
        let id_length = block.read_u16::<LittleEndian>()?;
        let filter_info_length = block.read_u16::<LittleEndian>()?;
        if filter_info_length != 0 {
            return Err(HdfError::CorruptFile(
                "filtered fractal heaps are not supported for link storage".into(),
            ));
        }
        block.skip_bytes(1)?; // flags
        let _max_managed_size = block.read_u32::<LittleEndian>()?;
        block.skip_bytes(l)?; // next huge id
        block.skip_bytes(o)?; // huge v2 B-tree
        block.skip_bytes(l)?; // free space
        block.skip_bytes(o)?; // free space manager
        block.skip_bytes(l)?; // managed space
        block.skip_bytes(l)?; // allocated managed space
        block.skip_bytes(l)?; // direct block iterator offset
        let managed_object_count = block.read_sized(ctx.length_size)?;
        block.skip_bytes(4 * l)?; // huge/tiny sizes and counts
        let table_width = block.read_u16::<LittleEndian>()?;
        let starting_block_size = block.read_sized(ctx.length_size)?;
        let max_direct_block_size = block.read_sized(ctx.length_size)?;
        let max_heap_size_bits = block.read_u16::<LittleEndian>()?;
        block.skip_bytes(2)?; // starting rows in root indirect block
        let root_address = block.read_offset(ctx.offset_size)?;
        let root_rows = block.read_u16::<LittleEndian>()?;

        if table_width == 0 || starting_block_size == 0 {
            return Err(HdfError::CorruptFile(
                "fractal heap doubling table is degenerate".into(),
            ));
        }

        let mut heap = FractalHeap {
            id_length,
            table_width,
            starting_block_size,
            max_direct_block_size,
            max_heap_size_bits,
            managed_object_count,
            heap_offset_bytes: (max_heap_size_bits as u32).div_ceil(8) as u8,
            blocks: Vec::new(),
        };

        if let Some(root) = root_address {
            if root_rows == 0 {
                heap.blocks.push(DirectBlock {
                    heap_offset: 0,
                    size: starting_block_size,
                    address: root,
                });
            } else {
                heap.read_root_indirect(channel, ctx, root, root_rows)?;
            }
        }
        debug!(
            "fractal heap at {address:#x}: {} managed objects in {} direct blocks",
            managed_object_count,
            heap.blocks.len()
        );
        Ok(heap)
    }

    fn row_block_size(&self, row: u16) -> u64 {
        if row < 2 {
            self.starting_block_size
        } else {
            self.starting_block_size << (row - 1)
        }
    }

    fn max_direct_rows(&self) -> u16 {
        let ratio = self.max_direct_block_size / self.starting_block_size;
        (64 - ratio.leading_zeros()) as u16 + 1
    }

    /// ## Fractal Heap Indirect Block
    ///
    /// Signature `FHIB`, version, heap header address, block offset, then
    /// one child address per doubling-table slot, row-major. Rows past the
    /// maximum-direct-size row hold nested indirect blocks, which link
    /// storage never grows into; they are rejected rather than walked.
    fn read_root_indirect(
        &mut self,
        channel: &Channel,
        ctx: &FormatContext,
        address: u64,
        rows: u16,
    ) -> Result<()> {
        let slots = rows as usize * self.table_width as usize;
        let header_len = 4 + 1 + ctx.offset_size as usize + self.heap_offset_bytes as usize;
        let len = header_len + slots * ctx.offset_size as usize + 4;
        let mut block = channel.read_block(address, len)?;

        let mut signature = [0u8; 4];
        block.read_exact(&mut signature)?;
        if &signature != b"FHIB" {
            return Err(HdfError::CorruptFile(format!(
                "no FHIB signature at {address:#x}"
            )));
        }
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "fractal heap indirect block",
                version,
            });
        }
        block.skip_bytes(ctx.offset_size as usize)?; // heap header address
        block.skip_bytes(self.heap_offset_bytes as usize)?; // block offset

        let max_direct_rows = self.max_direct_rows();
        let mut heap_offset = 0u64;
        for row in 0..rows {
            let size = self.row_block_size(row);
            for _ in 0..self.table_width {
                let child = block.read_offset(ctx.offset_size)?;
                if let Some(child) = child {
                    if row >= max_direct_rows {
                        return Err(HdfError::CorruptFile(
                            "fractal heap grew into nested indirect blocks, beyond link storage"
                                .into(),
                        ));
                    }
                    self.blocks.push(DirectBlock {
                        heap_offset,
                        size,
                        address: child,
                    });
                }
                heap_offset += size;
            }
        }
        Ok(())
    }

    /// Resolves a managed heap id (as stored in v2 B-tree link records) to
    /// the object's payload bytes.
    pub fn object(&self, channel: &Channel, ctx: &FormatContext, id: &[u8]) -> Result<Vec<u8>> {
        if id.len() != self.id_length as usize {
            return Err(HdfError::CorruptFile(format!(
                "heap id is {} bytes, heap says {}",
                id.len(),
                self.id_length
            )));
        }
        let kind = (id[0] >> 4) & 0x03;
        if kind != 0 {
            return Err(HdfError::CorruptFile(format!(
                "heap id type {kind} is not a managed object"
            )));
        }
        let offset_bytes = self.heap_offset_bytes as usize;
        let length_bytes = self.id_length as usize - 1 - offset_bytes;
        let mut cursor = Cursor::new(id[1..].to_vec());
        let heap_offset = cursor.read_sized(offset_bytes as u8)?;
        let length = cursor.read_sized(length_bytes as u8)?;

        let block = self
            .blocks
            .iter()
            .find(|b| heap_offset >= b.heap_offset && heap_offset + length <= b.heap_offset + b.size)
            .ok_or_else(|| {
                HdfError::CorruptFile(format!(
                    "heap offset {heap_offset} not covered by any direct block"
                ))
            })?;

        // heap offsets address the heap's linear space, block headers
        // included, so the in-block delta maps directly to file bytes
        let address = block.address + (heap_offset - block.heap_offset);
        self.check_direct_block(channel, ctx, block)?;
        let data = channel.read_block(address, length as usize)?;
        Ok(data.into_inner())
    }

    // Validates the direct block signature once per access.
    fn check_direct_block(
        &self,
        channel: &Channel,
        _ctx: &FormatContext,
        block: &DirectBlock,
    ) -> Result<()> {
        let mut signature = [0u8; 4];
        channel.read_exact_at(block.address, &mut signature)?;
        if &signature != DIRECT_BLOCK_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no FHDB signature at {:#x}",
                block.address
            )));
        }
        Ok(())
    }
}
