mod btree;
mod checksum;
mod dataspace;
mod datatype;
mod error;
mod file;
mod fixed_point;
mod fractal;
mod group;
mod heap;
mod layout;
mod message;
mod reader;
mod superblock;

use std::io::{Cursor, Read, Seek, SeekFrom};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};

pub use btree::{BTreeV2, ChunkEntry};
pub use checksum::lookup3;
pub use dataspace::{Dataspace, HyperslabDim, Selection};
pub use datatype::{
    CharacterSet, CompoundMember, Datatype, DatatypeClass, DatatypeProperties, FloatSpec,
    ReferenceKind, StringPadding,
};
pub use error::{HdfError, Result};
pub use file::{Dataset, H5File, VirtualSource};
pub use fixed_point::{FixedPointSpec, FixedPointValue};
pub use fractal::FractalHeap;
pub use group::{DataObject, SymbolTableEntry, SymbolTableNode};
pub use heap::{GlobalHeap, GlobalHeapCollection, LocalHeap};
pub use layout::DataLayout;
pub use message::{
    AttributeInfoMessage, AttributeMessage, FillValueMessage, Filter, FilterPipelineMessage,
    GroupInfoMessage, HeaderMessage, LinkInfoMessage, LinkMessage, LinkTarget, Message,
    MessageFlags, MessageKind, ObjectHeader, SymbolTableMessage,
};
pub use reader::{Channel, ReadSeek};
pub use superblock::{FormatContext, RootPointer, Superblock, SIGNATURE};

pub(crate) use group::{dense_links, find_dense_link, find_in_symbol_table, symbol_table_names};
pub(crate) use reader::{name_padding, ReaderExt};

/// In-memory byte run pulled from the channel, parsed without holding the
/// channel mutex.
pub(crate) type Block = Cursor<Vec<u8>>;
