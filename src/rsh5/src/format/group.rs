use super::*;

/// # III.C Disk Format: Level 1C - Symbol Table Entry
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | offset-size | Link name offset into the group's local heap |
/// | offset-size | Object header address |
/// | 4           | Cache type (1: the scratch space caches the group's B-tree and heap addresses) |
/// | 4           | Reserved |
/// | 16          | Scratch space |
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    /// Cached group B-tree and local heap addresses, when cache type is 1.
    pub cached_group: Option<(u64, u64)>,
}

impl SymbolTableEntry {
    pub fn read(block: &mut Block, ctx: &FormatContext) -> Result<SymbolTableEntry> {
        let link_name_offset = block.read_sized(ctx.offset_size)?;
        let object_header_address = block.read_offset(ctx.offset_size)?.ok_or_else(|| {
            HdfError::CorruptFile("symbol table entry with undefined header address".into())
        })?;
        let cache_type = block.read_u32::<LittleEndian>()?;
        block.skip_bytes(4)?;

        let mut scratch = Cursor::new(block.read_bytes(16)?);
        let cached_group = if cache_type == 1 {
            let btree = scratch.read_offset(ctx.offset_size)?;
            let heap = scratch.read_offset(ctx.offset_size)?;
            btree.zip(heap)
        } else {
            None
        };

        Ok(SymbolTableEntry {
            link_name_offset,
            object_header_address,
            cache_type,
            cached_group,
        })
    }

    pub(crate) fn byte_len(ctx: &FormatContext) -> usize {
        2 * ctx.offset_size as usize + 24
    }
}

/// # III.B Disk Format: Level 1B - Group Symbol Table Nodes
///
/// `SNOD`, version 1, a count, and that many symbol table entries sorted by
/// link name.
pub struct SymbolTableNode {
    pub entries: Vec<SymbolTableEntry>,
}

pub const SYMBOL_NODE_SIGNATURE: &[u8; 4] = b"SNOD";

impl SymbolTableNode {
    pub fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<SymbolTableNode> {
        let mut header = channel.read_block(address, 8)?;
        let mut signature = [0u8; 4];
        header.read_exact(&mut signature)?;
        if &signature != SYMBOL_NODE_SIGNATURE {
            return Err(HdfError::CorruptFile(format!(
                "no SNOD signature at {address:#x}"
            )));
        }
        let version = header.read_u8()?;
        if version != 1 {
            return Err(HdfError::UnsupportedVersion {
                entity: "symbol table node",
                version,
            });
        }
        header.skip_bytes(1)?;
        let count = header.read_u16::<LittleEndian>()? as usize;

        let mut block =
            channel.read_block(address + 8, count * SymbolTableEntry::byte_len(ctx))?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(SymbolTableEntry::read(&mut block, ctx)?);
        }
        Ok(SymbolTableNode { entries })
    }
}

/// A named object in the group tree: a group or a dataset, owning its
/// decoded object header. Instances are cached by header address in the
/// open file, so repeated resolution of one path hands back the same
/// allocation.
#[derive(Debug)]
pub struct DataObject {
    pub address: u64,
    pub name: String,
    pub header: ObjectHeader,
}

impl DataObject {
    pub fn is_dataset(&self) -> bool {
        self.header.datatype().is_some() && self.header.layout().is_some()
    }

    /// Anything that is not a dataset participates in the tree as a group.
    pub fn is_group(&self) -> bool {
        !self.is_dataset()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeMessage> {
        self.header.attributes().find(|a| a.name == name)
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        self.header.attributes().map(|a| a.name.as_str()).collect()
    }

    pub fn modification_time(&self) -> Option<u32> {
        self.header.modification_time()
    }
}

/// Classic-path lookup: walk the group's B-tree to its symbol table nodes
/// and compare link names through the local heap.
pub fn find_in_symbol_table(
    channel: &Channel,
    ctx: &FormatContext,
    table: &SymbolTableMessage,
    name: &str,
) -> Result<Option<u64>> {
    let heap = LocalHeap::read(channel, ctx, table.local_heap_address)?;
    for node_address in btree::collect_symbol_nodes(channel, ctx, table.btree_address)? {
        let node = SymbolTableNode::read(channel, ctx, node_address)?;
        for entry in &node.entries {
            if heap.string_at(entry.link_name_offset)? == name {
                return Ok(Some(entry.object_header_address));
            }
        }
    }
    Ok(None)
}

/// All link names of a classic group, in symbol-table order.
pub fn symbol_table_names(
    channel: &Channel,
    ctx: &FormatContext,
    table: &SymbolTableMessage,
) -> Result<Vec<String>> {
    let heap = LocalHeap::read(channel, ctx, table.local_heap_address)?;
    let mut names = Vec::new();
    for node_address in btree::collect_symbol_nodes(channel, ctx, table.btree_address)? {
        let node = SymbolTableNode::read(channel, ctx, node_address)?;
        for entry in &node.entries {
            names.push(heap.string_at(entry.link_name_offset)?.to_string());
        }
    }
    Ok(names)
}

/// New-style dense lookup: the name-index v2 B-tree records are a 4-byte
/// lookup3 hash of the link name plus a fractal heap id; matching records
/// resolve through the heap to serialized link messages.
pub fn find_dense_link(
    channel: &Channel,
    ctx: &FormatContext,
    info: &LinkInfoMessage,
    name: &str,
) -> Result<Option<LinkMessage>> {
    let (Some(heap_address), Some(index_address)) =
        (info.fractal_heap_address, info.name_index_address)
    else {
        return Ok(None);
    };
    let heap = FractalHeap::read(channel, ctx, heap_address)?;
    let index = BTreeV2::read(channel, ctx, index_address)?;
    if index.record_type != 5 {
        return Err(HdfError::CorruptFile(format!(
            "group name index has record type {}, expected 5",
            index.record_type
        )));
    }

    let wanted_hash = checksum::lookup3(name.as_bytes());
    let mut found = None;
    index.visit_records(channel, ctx, |record| {
        if found.is_some() || record.len() < 4 {
            return Ok(());
        }
        let hash = u32::from_le_bytes(record[..4].try_into().unwrap());
        if hash != wanted_hash {
            return Ok(());
        }
        let object = heap.object(channel, ctx, &record[4..])?;
        let link = LinkMessage::read(&mut Cursor::new(object), ctx)?;
        if link.name == name {
            found = Some(link);
        }
        Ok(())
    })?;
    Ok(found)
}

/// All links of a dense group, in name-hash order.
pub fn dense_links(
    channel: &Channel,
    ctx: &FormatContext,
    info: &LinkInfoMessage,
) -> Result<Vec<LinkMessage>> {
    let (Some(heap_address), Some(index_address)) =
        (info.fractal_heap_address, info.name_index_address)
    else {
        return Ok(Vec::new());
    };
    let heap = FractalHeap::read(channel, ctx, heap_address)?;
    let index = BTreeV2::read(channel, ctx, index_address)?;
    let mut links = Vec::new();
    index.visit_records(channel, ctx, |record| {
        if record.len() < 4 {
            return Err(HdfError::CorruptFile("short name-index record".into()));
        }
        let object = heap.object(channel, ctx, &record[4..])?;
        links.push(LinkMessage::read(&mut Cursor::new(object), ctx)?);
        Ok(())
    })?;
    Ok(links)
}
