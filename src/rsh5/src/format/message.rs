use num_enum::TryFromPrimitive;

use super::*;

/// # IV.A.2 Disk Format: Level 2A2 - Data Object Header Messages
///
/// Message types decoded by this crate. Anything else is carried as
/// [`Message::Unknown`] unless the message's "fail if unknown" flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageKind {
    Nil = 0x0000,
    Dataspace = 0x0001,
    LinkInfo = 0x0002,
    Datatype = 0x0003,
    FillValueOld = 0x0004,
    FillValue = 0x0005,
    Link = 0x0006,
    DataLayout = 0x0008,
    GroupInfo = 0x000a,
    FilterPipeline = 0x000b,
    Attribute = 0x000c,
    Continuation = 0x0010,
    SymbolTable = 0x0011,
    ModificationTime = 0x0012,
    BTreeKValues = 0x0013,
    AttributeInfo = 0x0015,
}

bitflags! {
    /// Header message flags, shared by versions 1 and 2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const CONSTANT = 0x01;
        const SHARED = 0x02;
        const DONT_SHARE = 0x04;
        const FAIL_ON_UNKNOWN_WRITE = 0x08;
        const MARK_IF_UNKNOWN = 0x10;
        const MODIFIED_IF_UNKNOWN = 0x20;
        const SHAREABLE = 0x40;
        const FAIL_ON_UNKNOWN_ALWAYS = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Nil,
    Dataspace(Dataspace),
    LinkInfo(LinkInfoMessage),
    Datatype(Datatype),
    FillValue(FillValueMessage),
    Link(LinkMessage),
    DataLayout(DataLayout),
    GroupInfo(GroupInfoMessage),
    FilterPipeline(FilterPipelineMessage),
    Attribute(AttributeMessage),
    Continuation { offset: u64, length: u64 },
    SymbolTable(SymbolTableMessage),
    ModificationTime { seconds: u32 },
    BTreeKValues {
        indexed_storage_k: u16,
        group_internal_k: u16,
        group_leaf_k: u16,
    },
    AttributeInfo(AttributeInfoMessage),
    Unknown { kind: u16, data: Vec<u8> },
}

impl Message {
    fn read(kind: u16, block: &mut Block, ctx: &FormatContext) -> Result<Message> {
        let Ok(kind) = MessageKind::try_from(kind) else {
            return Ok(Message::Unknown {
                kind,
                data: std::mem::take(block.get_mut()),
            });
        };
        trace!("decoding header message {kind:?}");
        Ok(match kind {
            MessageKind::Nil => Message::Nil,
            MessageKind::Dataspace => Message::Dataspace(Dataspace::read(block, ctx)?),
            MessageKind::LinkInfo => Message::LinkInfo(LinkInfoMessage::read(block, ctx)?),
            MessageKind::Datatype => Message::Datatype(Datatype::read(block, ctx)?),
            MessageKind::FillValueOld => {
                let size = block.read_u32::<LittleEndian>()? as usize;
                Message::FillValue(FillValueMessage {
                    version: 1,
                    value: Some(block.read_bytes(size)?),
                })
            }
            MessageKind::FillValue => Message::FillValue(FillValueMessage::read(block)?),
            MessageKind::Link => Message::Link(LinkMessage::read(block, ctx)?),
            MessageKind::DataLayout => Message::DataLayout(DataLayout::read(block, ctx)?),
            MessageKind::GroupInfo => Message::GroupInfo(GroupInfoMessage::read(block)?),
            MessageKind::FilterPipeline => {
                Message::FilterPipeline(FilterPipelineMessage::read(block)?)
            }
            MessageKind::Attribute => Message::Attribute(AttributeMessage::read(block, ctx)?),
            MessageKind::Continuation => {
                let offset = block.read_offset(ctx.offset_size)?.ok_or_else(|| {
                    HdfError::CorruptHeader("continuation offset is undefined".into())
                })?;
                let length = block.read_sized(ctx.length_size)?;
                Message::Continuation { offset, length }
            }
            MessageKind::SymbolTable => Message::SymbolTable(SymbolTableMessage::read(block, ctx)?),
            MessageKind::ModificationTime => {
                let version = block.read_u8()?;
                if version != 1 {
                    return Err(HdfError::UnsupportedVersion {
                        entity: "modification time message",
                        version,
                    });
                }
                block.skip_bytes(3)?;
                Message::ModificationTime {
                    seconds: block.read_u32::<LittleEndian>()?,
                }
            }
            MessageKind::BTreeKValues => {
                let version = block.read_u8()?;
                if version != 0 {
                    return Err(HdfError::UnsupportedVersion {
                        entity: "B-tree K values message",
                        version,
                    });
                }
                Message::BTreeKValues {
                    indexed_storage_k: block.read_u16::<LittleEndian>()?,
                    group_internal_k: block.read_u16::<LittleEndian>()?,
                    group_leaf_k: block.read_u16::<LittleEndian>()?,
                }
            }
            MessageKind::AttributeInfo => {
                Message::AttributeInfo(AttributeInfoMessage::read(block, ctx)?)
            }
        })
    }
}

/// # IV.A.2.c The Link Info Message
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 1           | Version (0) |
/// | 1           | Flags (bit 0: creation order tracked, bit 1: creation order indexed) |
/// | 8           | Maximum creation index, if flag bit 0 |
/// | offset-size | Fractal heap address |
/// | offset-size | Name-index v2 B-tree address |
/// | offset-size | Creation-order-index v2 B-tree address, if flag bit 1 |
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfoMessage {
    pub max_creation_index: Option<u64>,
    pub fractal_heap_address: Option<u64>,
    pub name_index_address: Option<u64>,
    pub creation_order_index_address: Option<u64>,
}

impl LinkInfoMessage {
    fn read(block: &mut Block, ctx: &FormatContext) -> Result<LinkInfoMessage> {
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "link info message",
                version,
            });
        }
        let flags = block.read_u8()?;
        let max_creation_index = if flags & 0x01 != 0 {
            Some(block.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        let fractal_heap_address = block.read_offset(ctx.offset_size)?;
        let name_index_address = block.read_offset(ctx.offset_size)?;
        let creation_order_index_address = if flags & 0x02 != 0 {
            block.read_offset(ctx.offset_size)?
        } else {
            None
        };
        Ok(LinkInfoMessage {
            max_creation_index,
            fractal_heap_address,
            name_index_address,
            creation_order_index_address,
        })
    }
}

/// # IV.A.2.g The Link Message
///
/// | Size | Field |
/// | ---- | ----- |
/// | 1    | Version (1) |
/// | 1    | Flags: bits 0-1 size-of-length-of-name, bit 2 creation order present, bit 3 link type present, bit 4 character set present |
/// | 1    | Link type (0 hard, 1 soft), if flag bit 3; hard otherwise |
/// | 8    | Creation order, if flag bit 2 |
/// | 1    | Character set, if flag bit 4 |
/// | var  | Length of name (1, 2, 4 or 8 bytes per flag bits 0-1), then the name, not NUL-terminated |
/// | -    | Hard link: object header address. Soft link: 2-byte length plus target path |
#[derive(Debug, Clone, PartialEq)]
pub struct LinkMessage {
    pub name: String,
    pub creation_order: Option<u64>,
    pub target: LinkTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkTarget {
    Hard { header_address: u64 },
    Soft { path: String },
}

impl LinkMessage {
    pub(crate) fn read(block: &mut Block, ctx: &FormatContext) -> Result<LinkMessage> {
        let version = block.read_u8()?;
        if version != 1 {
            return Err(HdfError::UnsupportedVersion {
                entity: "link message",
                version,
            });
        }
        let flags = block.read_u8()?;
        let link_type = if flags & 0x08 != 0 { block.read_u8()? } else { 0 };
        let creation_order = if flags & 0x04 != 0 {
            Some(block.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        if flags & 0x10 != 0 {
            block.skip_bytes(1)?; // character set; names are UTF-8 either way
        }
        let name_len = block.read_sized(1 << (flags & 0x03))? as usize;
        let name_bytes = block.read_bytes(name_len)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|e| HdfError::CorruptFile(format!("link name is not UTF-8: {e}")))?;

        let target = match link_type {
            0 => LinkTarget::Hard {
                header_address: block.read_offset(ctx.offset_size)?.ok_or_else(|| {
                    HdfError::CorruptFile(format!("hard link '{name}' has undefined address"))
                })?,
            },
            1 => {
                let len = block.read_u16::<LittleEndian>()? as usize;
                let path_bytes = block.read_bytes(len)?;
                let path = String::from_utf8(path_bytes).map_err(|e| {
                    HdfError::CorruptFile(format!("soft link target is not UTF-8: {e}"))
                })?;
                LinkTarget::Soft { path }
            }
            other => {
                return Err(HdfError::UnsupportedDatatype(format!(
                    "unsupported link type {other}"
                )))
            }
        };
        Ok(LinkMessage {
            name,
            creation_order,
            target,
        })
    }
}

/// # IV.A.2.f The Data Storage - Fill Value Message
///
/// Version 2: version (1), space allocation time (1), fill value write
/// time (1), fill value defined (1), then size (4) and the value when the
/// defined flag is set. Version 3 collapses the three bytes into a flag
/// byte whose bit 5 announces a stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct FillValueMessage {
    pub version: u8,
    pub value: Option<Vec<u8>>,
}

impl FillValueMessage {
    fn read(block: &mut Block) -> Result<FillValueMessage> {
        let version = block.read_u8()?;
        let value = match version {
            1 | 2 => {
                block.skip_bytes(2)?; // allocation time, write time
                let defined = block.read_u8()? != 0;
                if version == 1 || defined {
                    let size = block.read_u32::<LittleEndian>()? as usize;
                    Some(block.read_bytes(size)?)
                } else {
                    None
                }
            }
            3 => {
                let flags = block.read_u8()?;
                if flags & 0x20 != 0 {
                    let size = block.read_u32::<LittleEndian>()? as usize;
                    Some(block.read_bytes(size)?)
                } else {
                    None
                }
            }
            _ => {
                return Err(HdfError::UnsupportedVersion {
                    entity: "fill value message",
                    version,
                })
            }
        };
        Ok(FillValueMessage { version, value })
    }
}

/// # IV.A.2.k The Group Info Message
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfoMessage {
    pub max_compact_links: Option<u16>,
    pub min_dense_links: Option<u16>,
    pub estimated_entries: Option<u16>,
    pub estimated_name_length: Option<u16>,
}

impl GroupInfoMessage {
    fn read(block: &mut Block) -> Result<GroupInfoMessage> {
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "group info message",
                version,
            });
        }
        let flags = block.read_u8()?;
        let (max_compact_links, min_dense_links) = if flags & 0x01 != 0 {
            (
                Some(block.read_u16::<LittleEndian>()?),
                Some(block.read_u16::<LittleEndian>()?),
            )
        } else {
            (None, None)
        };
        let (estimated_entries, estimated_name_length) = if flags & 0x02 != 0 {
            (
                Some(block.read_u16::<LittleEndian>()?),
                Some(block.read_u16::<LittleEndian>()?),
            )
        } else {
            (None, None)
        };
        Ok(GroupInfoMessage {
            max_compact_links,
            min_dense_links,
            estimated_entries,
            estimated_name_length,
        })
    }
}

/// # IV.A.2.l The Data Storage - Filter Pipeline Message
///
/// Filters are parsed, never executed. Well-known ids: 1 deflate,
/// 2 shuffle, 3 fletcher32, 4 szip, 5 nbit, 6 scale-offset.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPipelineMessage {
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub id: u16,
    pub name: String,
    pub flags: u16,
    pub client_data: Vec<u32>,
}

impl FilterPipelineMessage {
    fn read(block: &mut Block) -> Result<FilterPipelineMessage> {
        let version = block.read_u8()?;
        let count = block.read_u8()? as usize;
        match version {
            1 => block.skip_bytes(6)?,
            2 => {}
            _ => {
                return Err(HdfError::UnsupportedVersion {
                    entity: "filter pipeline message",
                    version,
                })
            }
        }
        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            let id = block.read_u16::<LittleEndian>()?;
            let name_length = if version == 2 && id < 256 {
                0
            } else {
                block.read_u16::<LittleEndian>()? as usize
            };
            let flags = block.read_u16::<LittleEndian>()?;
            let value_count = block.read_u16::<LittleEndian>()? as usize;
            let name = if name_length > 0 {
                let padded = if version == 1 {
                    name_length.div_ceil(8) * 8
                } else {
                    name_length
                };
                let bytes = block.read_bytes(padded)?;
                String::from_utf8_lossy(&bytes[..name_length])
                    .trim_end_matches('\0')
                    .to_string()
            } else {
                String::new()
            };
            let mut client_data = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                client_data.push(block.read_u32::<LittleEndian>()?);
            }
            if version == 1 && value_count % 2 == 1 {
                block.skip_bytes(4)?;
            }
            filters.push(Filter {
                id,
                name,
                flags,
                client_data,
            });
        }
        Ok(FilterPipelineMessage { filters })
    }
}

/// # IV.A.2.m The Attribute Message
///
/// Version 1 pads the name, datatype and dataspace blocks to 8-byte
/// boundaries; versions 2 and 3 store them back to back. Version 3 adds a
/// name character set byte.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeMessage {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    /// Raw element bytes, `dataspace.element_count() * datatype.size` long.
    pub data: Vec<u8>,
}

impl AttributeMessage {
    fn read(block: &mut Block, ctx: &FormatContext) -> Result<AttributeMessage> {
        let version = block.read_u8()?;
        if !matches!(version, 1 | 2 | 3) {
            return Err(HdfError::UnsupportedVersion {
                entity: "attribute message",
                version,
            });
        }
        let flags = block.read_u8()?;
        if version >= 2 && flags & 0x03 != 0 {
            return Err(HdfError::UnsupportedDatatype(
                "shared attribute datatype/dataspace".into(),
            ));
        }
        let name_size = block.read_u16::<LittleEndian>()? as usize;
        let datatype_size = block.read_u16::<LittleEndian>()? as usize;
        let dataspace_size = block.read_u16::<LittleEndian>()? as usize;
        if version == 3 {
            block.skip_bytes(1)?; // name character set
        }

        let pad = |n: usize| if version == 1 { n.div_ceil(8) * 8 } else { n };

        let name_bytes = block.read_bytes(pad(name_size))?;
        let name = String::from_utf8_lossy(&name_bytes[..name_size])
            .trim_end_matches('\0')
            .to_string();

        let mut datatype_block = Cursor::new(block.read_bytes(pad(datatype_size))?);
        let datatype = Datatype::read(&mut datatype_block, ctx)?;

        let mut dataspace_block = Cursor::new(block.read_bytes(pad(dataspace_size))?);
        let dataspace = Dataspace::read(&mut dataspace_block, ctx)?;

        let data_len = dataspace.element_count() as usize * datatype.size as usize;
        let data = block.read_bytes(data_len)?;

        Ok(AttributeMessage {
            name,
            datatype,
            dataspace,
            data,
        })
    }
}

/// # IV.A.2.r The Symbol Table Message
///
/// Points a classic group at its version 1 B-tree and local name heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub local_heap_address: u64,
}

impl SymbolTableMessage {
    fn read(block: &mut Block, ctx: &FormatContext) -> Result<SymbolTableMessage> {
        let btree_address = block
            .read_offset(ctx.offset_size)?
            .ok_or_else(|| HdfError::CorruptHeader("symbol table B-tree address undefined".into()))?;
        let local_heap_address = block
            .read_offset(ctx.offset_size)?
            .ok_or_else(|| HdfError::CorruptHeader("symbol table heap address undefined".into()))?;
        Ok(SymbolTableMessage {
            btree_address,
            local_heap_address,
        })
    }
}

/// # IV.A.2.v The Attribute Info Message
///
/// Present when attributes are stored densely, mirroring the link info
/// message's fractal heap + v2 B-tree pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfoMessage {
    pub max_creation_index: Option<u16>,
    pub fractal_heap_address: Option<u64>,
    pub name_index_address: Option<u64>,
    pub creation_order_index_address: Option<u64>,
}

impl AttributeInfoMessage {
    fn read(block: &mut Block, ctx: &FormatContext) -> Result<AttributeInfoMessage> {
        let version = block.read_u8()?;
        if version != 0 {
            return Err(HdfError::UnsupportedVersion {
                entity: "attribute info message",
                version,
            });
        }
        let flags = block.read_u8()?;
        let max_creation_index = if flags & 0x01 != 0 {
            Some(block.read_u16::<LittleEndian>()?)
        } else {
            None
        };
        let fractal_heap_address = block.read_offset(ctx.offset_size)?;
        let name_index_address = block.read_offset(ctx.offset_size)?;
        let creation_order_index_address = if flags & 0x02 != 0 {
            block.read_offset(ctx.offset_size)?
        } else {
            None
        };
        Ok(AttributeInfoMessage {
            max_creation_index,
            fractal_heap_address,
            name_index_address,
            creation_order_index_address,
        })
    }
}

/// One decoded header message with its framing.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMessage {
    pub flags: MessageFlags,
    pub creation_order: Option<u16>,
    pub message: Message,
}

/// # IV.A.1 Disk Format: Level 2A1 - Data Object Header Prefix
///
/// A decoded object header: the prefix plus every message from the root
/// chunk and all continuation chunks, in file order. Continuations are
/// queued, never recursed into, and a chunk address may be visited only
/// once.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub version: u8,
    /// File offset of the header prefix.
    pub address: u64,
    pub messages: Vec<HeaderMessage>,
}

const V2_SIGNATURE: &[u8; 4] = b"OHDR";
const V2_CONTINUATION_SIGNATURE: &[u8; 4] = b"OCHK";

impl ObjectHeader {
    pub fn read(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<ObjectHeader> {
        let mut probe = [0u8; 4];
        channel.read_exact_at(address, &mut probe)?;
        if &probe == V2_SIGNATURE {
            Self::read_v2(channel, ctx, address)
        } else {
            Self::read_v1(channel, ctx, address)
        }
    }

    /// ## IV.A.1.a Version 1 Data Object Header Prefix
    ///
    /// | Size | Field |
    /// | ---- | ----- |
    /// | 1    | Version (1) |
    /// | 1    | Reserved |
    /// | 2    | Total number of header messages |
    /// | 4    | Object reference count |
    /// | 4    | Object header size (byte length of the first message chunk) |
    /// | 4    | Reserved, padding to an 8-byte boundary |
    fn read_v1(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<ObjectHeader> {
        let mut prefix = channel.read_block(address, 16)?;
        let version = prefix.read_u8()?;
        if version != 1 {
            return Err(HdfError::UnsupportedVersion {
                entity: "object header",
                version,
            });
        }
        prefix.skip_bytes(1)?;
        let message_count = prefix.read_u16::<LittleEndian>()?;
        let _reference_count = prefix.read_u32::<LittleEndian>()?;
        let header_size = prefix.read_u32::<LittleEndian>()?;
        debug!("v1 object header at {address:#x}: {message_count} messages, first chunk {header_size} bytes");

        let mut messages = Vec::with_capacity(message_count as usize);
        let mut queue = std::collections::VecDeque::new();
        let mut visited = std::collections::HashSet::new();
        queue.push_back((address + 16, header_size as u64));
        visited.insert(address + 16);

        while let Some((chunk_address, chunk_length)) = queue.pop_front() {
            let mut chunk = channel.read_block(chunk_address, chunk_length as usize)?;
            while chunk_length - chunk.position() >= 8 {
                let kind = chunk.read_u16::<LittleEndian>()?;
                let size = chunk.read_u16::<LittleEndian>()? as usize;
                let flags = MessageFlags::from_bits_retain(chunk.read_u8()?);
                chunk.skip_bytes(3)?;
                let mut payload = Cursor::new(chunk.read_bytes(size)?);

                let message = Self::decode_payload(kind, &mut payload, flags, ctx)?;
                if let Message::Continuation { offset, length } = &message {
                    if !visited.insert(*offset) {
                        return Err(HdfError::CorruptHeader(format!(
                            "continuation cycle through offset {offset:#x}"
                        )));
                    }
                    queue.push_back((*offset, *length));
                }
                messages.push(HeaderMessage {
                    flags,
                    creation_order: None,
                    message,
                });
            }
        }

        Ok(ObjectHeader {
            version: 1,
            address,
            messages,
        })
    }

    /// ## IV.A.1.b Version 2 Data Object Header Prefix
    ///
    /// | Size    | Field |
    /// | ------- | ----- |
    /// | 4       | Signature `OHDR` |
    /// | 1       | Version (2) |
    /// | 1       | Flags |
    /// | 4 x 4   | Access/modification/change/birth times, if flag bit 5 |
    /// | 2 x 2   | Max compact / min dense attribute counts, if flag bit 4 |
    /// | 1/2/4/8 | Size of chunk 0, width selected by flag bits 0-1 |
    /// | -       | Messages |
    /// | 4       | Jenkins lookup3 checksum of everything above |
    ///
    /// Continuation chunks carry an `OCHK` signature and their own trailing
    /// checksum.
    fn read_v2(channel: &Channel, ctx: &FormatContext, address: u64) -> Result<ObjectHeader> {
        let mut fixed = channel.read_block(address, 6)?;
        fixed.skip_bytes(4)?;
        let version = fixed.read_u8()?;
        if version != 2 {
            return Err(HdfError::UnsupportedVersion {
                entity: "object header",
                version,
            });
        }
        let flags = fixed.read_u8()?;
        let times_len = if flags & 0x20 != 0 { 16 } else { 0 };
        let phase_len = if flags & 0x10 != 0 { 4 } else { 0 };
        let size_width = 1usize << (flags & 0x03);
        let tracked_order = flags & 0x04 != 0;

        let prefix_len = 6 + times_len + phase_len + size_width;
        let mut prefix = channel.read_block(address, prefix_len)?;
        prefix.skip_bytes(6 + times_len + phase_len)?;
        let chunk_size = prefix.read_sized(size_width as u8)?;

        // prefix + messages + checksum, verified as a whole
        let total = prefix_len + chunk_size as usize + 4;
        let whole = channel.read_block(address, total)?;
        let bytes = whole.into_inner();
        let stored = u32::from_le_bytes(bytes[total - 4..].try_into().unwrap());
        let computed = checksum::lookup3(&bytes[..total - 4]);
        if stored != computed {
            return Err(HdfError::CorruptHeader(format!(
                "object header checksum mismatch at {address:#x}: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let mut messages = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        let mut visited = std::collections::HashSet::new();
        visited.insert(address);

        let mut chunk = Cursor::new(bytes[prefix_len..total - 4].to_vec());
        loop {
            Self::read_v2_messages(&mut chunk, ctx, tracked_order, &mut messages, &mut queue, &mut visited)?;
            let Some((next_address, next_length)) = queue.pop_front() else {
                break;
            };
            // OCHK signature + payload + checksum
            let block = channel.read_block(next_address, next_length as usize)?;
            let bytes = block.into_inner();
            if bytes.len() < 8 || &bytes[..4] != V2_CONTINUATION_SIGNATURE {
                return Err(HdfError::CorruptHeader(format!(
                    "continuation chunk at {next_address:#x} lacks OCHK signature"
                )));
            }
            let stored = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
            let computed = checksum::lookup3(&bytes[..bytes.len() - 4]);
            if stored != computed {
                return Err(HdfError::CorruptHeader(format!(
                    "continuation checksum mismatch at {next_address:#x}"
                )));
            }
            chunk = Cursor::new(bytes[4..bytes.len() - 4].to_vec());
        }

        Ok(ObjectHeader {
            version: 2,
            address,
            messages,
        })
    }

    fn read_v2_messages(
        chunk: &mut Block,
        ctx: &FormatContext,
        tracked_order: bool,
        messages: &mut Vec<HeaderMessage>,
        queue: &mut std::collections::VecDeque<(u64, u64)>,
        visited: &mut std::collections::HashSet<u64>,
    ) -> Result<()> {
        let chunk_len = chunk.get_ref().len() as u64;
        let frame = 4 + if tracked_order { 2 } else { 0 };
        while chunk_len - chunk.position() >= frame {
            let kind = chunk.read_u8()? as u16;
            let size = chunk.read_u16::<LittleEndian>()? as usize;
            let flags = MessageFlags::from_bits_retain(chunk.read_u8()?);
            let mut payload = Cursor::new(chunk.read_bytes(size)?);
            let creation_order = if tracked_order {
                Some(chunk.read_u16::<LittleEndian>()?)
            } else {
                None
            };

            let message = Self::decode_payload(kind, &mut payload, flags, ctx)?;
            if let Message::Continuation { offset, length } = &message {
                if !visited.insert(*offset) {
                    return Err(HdfError::CorruptHeader(format!(
                        "continuation cycle through offset {offset:#x}"
                    )));
                }
                queue.push_back((*offset, *length));
            }
            messages.push(HeaderMessage {
                flags,
                creation_order,
                message,
            });
        }
        Ok(())
    }

    fn decode_payload(
        kind: u16,
        payload: &mut Block,
        flags: MessageFlags,
        ctx: &FormatContext,
    ) -> Result<Message> {
        let message = Message::read(kind, payload, ctx)?;
        if let Message::Unknown { kind, .. } = &message {
            if flags.contains(MessageFlags::FAIL_ON_UNKNOWN_ALWAYS) {
                return Err(HdfError::CorruptHeader(format!(
                    "unknown message type {kind:#06x} is marked fail-if-unknown"
                )));
            }
            warn!("skipping unknown header message type {kind:#06x}");
        }
        Ok(message)
    }

    /// First message of the given variant, if any.
    pub fn find<'a, T>(&'a self, select: impl Fn(&'a Message) -> Option<T>) -> Option<T> {
        self.messages.iter().find_map(|m| select(&m.message))
    }

    pub fn dataspace(&self) -> Option<&Dataspace> {
        self.find(|m| match m {
            Message::Dataspace(space) => Some(space),
            _ => None,
        })
    }

    pub fn datatype(&self) -> Option<&Datatype> {
        self.find(|m| match m {
            Message::Datatype(dt) => Some(dt),
            _ => None,
        })
    }

    pub fn layout(&self) -> Option<&DataLayout> {
        self.find(|m| match m {
            Message::DataLayout(layout) => Some(layout),
            _ => None,
        })
    }

    pub fn symbol_table(&self) -> Option<&SymbolTableMessage> {
        self.find(|m| match m {
            Message::SymbolTable(st) => Some(st),
            _ => None,
        })
    }

    pub fn link_info(&self) -> Option<&LinkInfoMessage> {
        self.find(|m| match m {
            Message::LinkInfo(info) => Some(info),
            _ => None,
        })
    }

    pub fn fill_value(&self) -> Option<&FillValueMessage> {
        self.find(|m| match m {
            Message::FillValue(fill) => Some(fill),
            _ => None,
        })
    }

    pub fn filters(&self) -> Option<&FilterPipelineMessage> {
        self.find(|m| match m {
            Message::FilterPipeline(pipeline) => Some(pipeline),
            _ => None,
        })
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeMessage> {
        self.messages.iter().filter_map(|m| match &m.message {
            Message::Attribute(attr) => Some(attr),
            _ => None,
        })
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkMessage> {
        self.messages.iter().filter_map(|m| match &m.message {
            Message::Link(link) => Some(link),
            _ => None,
        })
    }

    pub fn modification_time(&self) -> Option<u32> {
        self.find(|m| match m {
            Message::ModificationTime { seconds } => Some(*seconds),
            _ => None,
        })
    }
}
