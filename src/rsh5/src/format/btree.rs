use super::*;

/// # III.A.1 Disk Format: Level 1A1 - Version 1 B-trees
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 4           | Signature `TREE` |
/// | 1           | Node type (0: group node, 1: raw data chunk node) |
/// | 1           | Node level (0 is a leaf) |
/// | 2           | Entries used |
/// | offset-size | Address of left sibling |
/// | offset-size | Address of right sibling |
/// | -           | Alternating keys and child pointers, keys first and last |
///
/// Group node keys are byte offsets into the group's local heap
/// (length-size each); children of a leaf are symbol table node addresses.
/// Chunk node keys are the chunk byte size, a filter mask and one 8-byte
/// offset per dataset dimension plus a trailing zero; children of a leaf
/// are chunk data addresses.
pub const BTREE_V1_SIGNATURE: &[u8; 4] = b"TREE";

pub struct BTreeV1Node {
    pub node_type: u8,
    pub level: u8,
    pub entries_used: u16,
    pub left_sibling: Option<u64>,
    pub right_sibling: Option<u64>,
    body: Block,
}

impl BTreeV1Node {
    /// Upper bound on the bytes a node can occupy, used to size the block
    /// read: worst case is a chunk node with 32 dimensions.
    fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<BTreeV1Node> {
        let mut block = channel.read_block_at_most(address, 8192)?;
        let mut signature = [0u8; 4];
        block.read_exact(&mut signature)?;
        if &signature != BTREE_V1_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no TREE signature at {address:#x}"
            )));
        }
        let node_type = block.read_u8()?;
        let level = block.read_u8()?;
        let entries_used = block.read_u16::<LittleEndian>()?;
        let left_sibling = block.read_offset(ctx.offset_size)?;
        let right_sibling = block.read_offset(ctx.offset_size)?;
        trace!("TREE node at {address:#x}: type {node_type}, level {level}, {entries_used} entries");
        Ok(BTreeV1Node {
            node_type,
            level,
            entries_used,
            left_sibling,
            right_sibling,
            body: block,
        })
    }
}

/// A classic group B-tree walked down to its symbol-table-node addresses,
/// left to right.
pub fn collect_symbol_nodes(
    channel: &Channel,
    ctx: &FormatContext,
    address: u64,
) -> Result<Vec<u64>> {
    let mut nodes = Vec::new();
    walk_group_node(channel, ctx, address, &mut nodes, 0)?;
    Ok(nodes)
}

fn walk_group_node(
    channel: &Channel,
    ctx: &FormatContext,
    address: u64,
    out: &mut Vec<u64>,
    depth: usize,
) -> Result<()> {
    if depth > 64 {
        return Err(HdfError::CorruptFile(
            "group B-tree deeper than 64 levels".into(),
        ));
    }
    let mut node = BTreeV1Node::read(channel, ctx, address)?;
    if node.node_type != 0 {
        return Err(HdfError::CorruptFile(format!(
            "expected group B-tree node at {address:#x}, found type {}",
            node.node_type
        )));
    }
    // key 0, then entries_used (child, key) pairs
    node.body.skip_bytes(ctx.length_size as usize)?;
    for _ in 0..node.entries_used {
        let child = node.body.read_offset(ctx.offset_size)?.ok_or_else(|| {
            HdfError::CorruptFile("group B-tree child address undefined".into())
        })?;
        node.body.skip_bytes(ctx.length_size as usize)?;
        if node.level == 0 {
            out.push(child);
        } else {
            walk_group_node(channel, ctx, child, out, depth + 1)?;
        }
    }
    Ok(())
}

/// One chunk of a chunked dataset, located through the version 1 B-tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    /// Byte size of the stored chunk.
    pub size: u32,
    pub filter_mask: u32,
    /// Element offsets of the chunk origin, one per dataset dimension.
    pub offsets: Vec<u64>,
    pub address: u64,
}

/// Collects every chunk of a dataset with `rank` dimensions from the
/// version 1 B-tree rooted at `address`.
pub fn collect_chunks(
    channel: &Channel,
    ctx: &FormatContext,
    address: u64,
    rank: usize,
) -> Result<Vec<ChunkEntry>> {
    let mut chunks = Vec::new();
    walk_chunk_node(channel, ctx, address, rank, &mut chunks, 0)?;
    Ok(chunks)
}

fn read_chunk_key(block: &mut Block, rank: usize) -> Result<(u32, u32, Vec<u64>)> {
    let size = block.read_u32::<LittleEndian>()?;
    let filter_mask = block.read_u32::<LittleEndian>()?;
    let mut offsets = Vec::with_capacity(rank);
    for _ in 0..rank {
        offsets.push(block.read_u64::<LittleEndian>()?);
    }
    // trailing element-dimension offset, always zero
    block.skip_bytes(8)?;
    Ok((size, filter_mask, offsets))
}

fn walk_chunk_node(
    channel: &Channel,
    ctx: &FormatContext,
    address: u64,
    rank: usize,
    out: &mut Vec<ChunkEntry>,
    depth: usize,
) -> Result<()> {
    if depth > 64 {
        return Err(HdfError::CorruptFile(
            "chunk B-tree deeper than 64 levels".into(),
        ));
    }
    let mut node = BTreeV1Node::read(channel, ctx, address)?;
    if node.node_type != 1 {
        return Err(HdfError::CorruptFile(format!(
            "expected chunk B-tree node at {address:#x}, found type {}",
            node.node_type
        )));
    }
    for _ in 0..node.entries_used {
        let (size, filter_mask, offsets) = read_chunk_key(&mut node.body, rank)?;
        let child = node.body.read_offset(ctx.offset_size)?.ok_or_else(|| {
            HdfError::CorruptFile("chunk B-tree child address undefined".into())
        })?;
        if node.level == 0 {
            out.push(ChunkEntry {
                size,
                filter_mask,
                offsets,
                address: child,
            });
        } else {
            walk_chunk_node(channel, ctx, child, rank, out, depth + 1)?;
        }
    }
    Ok(())
}

/// # III.A.2 Disk Format: Level 1A2 - Version 2 B-trees
///
/// The header:
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 4           | Signature `BTHD` |
/// | 1           | Version (0) |
/// | 1           | Record type |
/// | 4           | Node size |
/// | 2           | Record size |
/// | 2           | Depth |
/// | 1           | Split percent |
/// | 1           | Merge percent |
/// | offset-size | Root node address |
/// | 2           | Number of records in root |
/// | length-size | Total records in tree |
/// | 4           | Checksum |
///
/// Record type 5 (link name) records are a 4-byte name hash followed by a
/// 7-byte fractal heap id.
pub struct BTreeV2 {
    pub record_type: u8,
    pub record_size: u16,
    pub depth: u16,
    pub root_address: Option<u64>,
    pub root_record_count: u16,
    pub total_record_count: u64,
    node_size: u32,
}

const BTREE_V2_HEADER_SIGNATURE: &[u8; 4] = b"BTHD";
const BTREE_V2_INTERNAL_SIGNATURE: &[u8; 4] = b"BTIN";
const BTREE_V2_LEAF_SIGNATURE: &[u8; 4] = b"BTLF";

impl BTreeV2 {
    pub fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<BTreeV2> {
        let header_len = 16 + ctx.offset_size as usize + 2 + ctx.length_size as usize + 4;
        let mut block = channel.read_block(address, header_len)?;
        let mut signature = [0u8; 4];
        block.read_exact(&mut signature)?;
        if &signature != BTREE_V2_HEADER_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no BTHD signature at {address:#x}"
            )));
        }
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "v2 B-tree header",
                version,
            });
        }
        let record_type = block.read_u8()?;
        let node_size = block.read_u32::<LittleEndian>()?;
        let record_size = block.read_u16::<LittleEndian>()?;
        let depth = block.read_u16::<LittleEndian>()?;
        block.skip_bytes(2)?; // split and merge percents
        let root_address = block.read_offset(ctx.offset_size)?;
        let root_record_count = block.read_u16::<LittleEndian>()?;
        let total_record_count = block.read_sized(ctx.length_size)?;
        Ok(BTreeV2 {
            record_type,
            record_size,
            depth,
            root_address,
            root_record_count,
            total_record_count,
            node_size,
        })
    }

    /// Visits every record in the tree left to right, handing the raw
    /// record bytes to `visit`.
    pub fn visit_records(
        &self,
        channel: &Channel,
        ctx: &FormatContext,
        mut visit: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let Some(root) = self.root_address else {
            return Ok(());
        };
        self.visit_node(channel, ctx, root, self.root_record_count as u64, self.depth, &mut visit)
    }

    fn visit_node(
        &self,
        channel: &Channel,
        ctx: &FormatContext,
        address: u64,
        record_count: u64,
        depth: u16,
        visit: &mut impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut block = channel.read_block_at_most(address, self.node_size as usize)?;
        let mut signature = [0u8; 4];
        block.read_exact(&mut signature)?;
        let expected = if depth == 0 {
            BTREE_V2_LEAF_SIGNATURE
        } else {
            BTREE_V2_INTERNAL_SIGNATURE
        };
        if &signature != expected {
            return Err(HdfError::CorruptFile(format!(
                "wrong v2 B-tree node signature at {address:#x}"
            )));
        }
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "v2 B-tree node",
                version,
            });
        }
        let node_type = block.read_u8()?;
        if node_type != self.record_type {
            return Err(HdfError::CorruptFile(format!(
                "v2 B-tree node at {address:#x} has record type {node_type}, header says {}",
                self.record_type
            )));
        }

        if depth == 0 {
            for _ in 0..record_count {
                let record = block.read_bytes(self.record_size as usize)?;
                visit(&record)?;
            }
            return Ok(());
        }

        // internal node: child pointers interleave the records; child
        // record counts are stored beside each pointer
        let count_size = encoded_width(self.node_size as u64);
        let mut children = Vec::with_capacity(record_count as usize + 1);
        let mut records = Vec::with_capacity(record_count as usize);
        for i in 0..=record_count {
            let child = block.read_offset(ctx.offset_size)?.ok_or_else(|| {
                HdfError::CorruptFile("v2 B-tree child address undefined".into())
            })?;
            let child_count = block.read_sized(count_size)?;
            children.push((child, child_count));
            if i < record_count {
                records.push(block.read_bytes(self.record_size as usize)?);
            }
        }
        for (i, (child, child_count)) in children.iter().enumerate() {
            self.visit_node(channel, ctx, *child, *child_count, depth - 1, visit)?;
            if i < records.len() {
                visit(&records[i])?;
            }
        }
        Ok(())
    }
}

/// Minimum bytes needed to store values up to `max`.
pub(crate) fn encoded_width(max: u64) -> u8 {
    let bits = 64 - max.leading_zeros();
    bits.div_ceil(8).max(1) as u8
}

#[cfg(test)]
mod test {
    use super::*;

    const CTX: FormatContext = FormatContext {
        offset_size: 8,
        length_size: 8,
    };

    fn group_leaf(children: &[u64]) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(BTREE_V1_SIGNATURE);
        image.push(0); // group node
        image.push(0); // leaf
        image.extend_from_slice(&(children.len() as u16).to_le_bytes());
        image.extend_from_slice(&[0xff; 8]);
        image.extend_from_slice(&[0xff; 8]);
        image.extend_from_slice(&0u64.to_le_bytes()); // key 0
        for child in children {
            image.extend_from_slice(&child.to_le_bytes());
            image.extend_from_slice(&0u64.to_le_bytes());
        }
        image
    }

    #[test]
    fn leaf_group_node_children() {
        let channel = Channel::from_bytes(group_leaf(&[0x100, 0x200, 0x300]));
        let nodes = collect_symbol_nodes(&channel, &CTX, 0).unwrap();
        assert_eq!(nodes, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn wrong_signature_is_corrupt() {
        let channel = Channel::from_bytes(b"HEAP\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0".to_vec());
        assert!(matches!(
            collect_symbol_nodes(&channel, &CTX, 0),
            Err(HdfError::CorruptFile(_))
        ));
    }

    #[test]
    fn chunk_leaf_entries() {
        let mut image = Vec::new();
        image.extend_from_slice(BTREE_V1_SIGNATURE);
        image.push(1); // chunk node
        image.push(0);
        image.extend_from_slice(&2u16.to_le_bytes());
        image.extend_from_slice(&[0xff; 8]);
        image.extend_from_slice(&[0xff; 8]);
        // entry 0: 1-d chunk at element offset 0
        image.extend_from_slice(&64u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u64.to_le_bytes());
        image.extend_from_slice(&0u64.to_le_bytes());
        image.extend_from_slice(&0x1000u64.to_le_bytes());
        // entry 1: element offset 16
        image.extend_from_slice(&64u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&16u64.to_le_bytes());
        image.extend_from_slice(&0u64.to_le_bytes());
        image.extend_from_slice(&0x2000u64.to_le_bytes());

        let channel = Channel::from_bytes(image);
        let chunks = collect_chunks(&channel, &CTX, 0, 1).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].offsets, vec![16]);
        assert_eq!(chunks[1].address, 0x2000);
    }

    #[test]
    fn encoded_width_boundaries() {
        assert_eq!(encoded_width(0), 1);
        assert_eq!(encoded_width(255), 1);
        assert_eq!(encoded_width(256), 2);
        assert_eq!(encoded_width(u16::MAX as u64 + 1), 3);
    }
}
