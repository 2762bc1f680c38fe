use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::data::ConverterRegistry;

use super::*;

/// An open HDF5 file: the shared channel, the superblock, the lazily built
/// object arena and global heap, and the file-scoped converter table.
///
/// The file exclusively owns the channel; read operations may be issued
/// from any number of threads, each I/O being one seek-and-read under the
/// channel mutex. Object headers are decoded once per address and cached,
/// so resolving the same path twice hands back the same `Arc`.
pub struct H5File {
    channel: Channel,
    superblock: Superblock,
    ctx: FormatContext,
    objects: Mutex<HashMap<u64, Arc<DataObject>>>,
    global_heap: GlobalHeap,
    converters: Arc<ConverterRegistry>,
}

const MAX_LINK_DEPTH: usize = 32;

impl H5File {
    pub fn open(path: impl AsRef<Path>) -> Result<H5File> {
        Self::open_with(path, ConverterRegistry::with_defaults())
    }

    pub fn open_with(path: impl AsRef<Path>, converters: ConverterRegistry) -> Result<H5File> {
        Self::from_channel(Channel::open(path.as_ref())?, converters)
    }

    /// Opens an in-memory image, e.g. one produced by the writer.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<H5File> {
        Self::from_channel(Channel::from_bytes(bytes), ConverterRegistry::with_defaults())
    }

    pub fn from_bytes_with(bytes: Vec<u8>, converters: ConverterRegistry) -> Result<H5File> {
        Self::from_channel(Channel::from_bytes(bytes), converters)
    }

    fn from_channel(channel: Channel, converters: ConverterRegistry) -> Result<H5File> {
        let superblock = Superblock::read(&channel)?;
        let ctx = superblock.context();
        debug!(
            "opened file: superblock v{}, offsets {} bytes, lengths {} bytes",
            superblock.version, superblock.offset_size, superblock.length_size
        );
        Ok(H5File {
            channel,
            superblock,
            ctx,
            objects: Mutex::new(HashMap::new()),
            global_heap: GlobalHeap::new(),
            converters: Arc::new(converters),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub(crate) fn context(&self) -> &FormatContext {
        &self.ctx
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    pub fn root(&self) -> Result<Arc<DataObject>> {
        self.object_at(self.superblock.root_header_address(), "/")
    }

    fn object_at(&self, address: u64, name: &str) -> Result<Arc<DataObject>> {
        if let Some(cached) = self.objects.lock().expect("object cache poisoned").get(&address) {
            return Ok(Arc::clone(cached));
        }
        let header = ObjectHeader::read(&self.channel, &self.ctx, address)?;
        let object = Arc::new(DataObject {
            address,
            name: name.to_string(),
            header,
        });
        let mut cache = self.objects.lock().expect("object cache poisoned");
        Ok(Arc::clone(cache.entry(address).or_insert(object)))
    }

    /// Resolves a '/'-separated path from the root group.
    pub fn resolve(&self, path: &str) -> Result<Arc<DataObject>> {
        self.resolve_from(self.root()?, path, 0)
    }

    fn resolve_from(
        &self,
        start: Arc<DataObject>,
        path: &str,
        depth: usize,
    ) -> Result<Arc<DataObject>> {
        let mut current = start;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.child_of(&current, component, depth)?;
        }
        Ok(current)
    }

    /// Looks `name` up in `parent`: compact link messages first, then the
    /// classic symbol table, then the dense fractal-heap storage.
    fn child_of(&self, parent: &DataObject, name: &str, depth: usize) -> Result<Arc<DataObject>> {
        if parent.is_dataset() {
            return Err(HdfError::WrongObjectKind(format!(
                "'{}' is a dataset, cannot resolve '{name}' inside it",
                parent.name
            )));
        }
        if depth > MAX_LINK_DEPTH {
            return Err(HdfError::CorruptFile(format!(
                "link chain deeper than {MAX_LINK_DEPTH} while resolving '{name}'"
            )));
        }

        for link in parent.header.links() {
            if link.name == name {
                return self.follow_link(link, name, depth);
            }
        }

        if let Some(table) = parent.header.symbol_table() {
            if let Some(address) = find_in_symbol_table(&self.channel, &self.ctx, table, name)? {
                return self.object_at(address, name);
            }
        }

        if let Some(info) = parent.header.link_info() {
            debug!("falling back to dense link storage for '{name}'");
            if let Some(link) = find_dense_link(&self.channel, &self.ctx, info, name)? {
                return self.follow_link(&link, name, depth);
            }
        }

        Err(HdfError::NotFound(format!(
            "no link named '{name}' in group '{}'",
            parent.name
        )))
    }

    fn follow_link(&self, link: &LinkMessage, name: &str, depth: usize) -> Result<Arc<DataObject>> {
        match &link.target {
            LinkTarget::Hard { header_address } => self.object_at(*header_address, name),
            LinkTarget::Soft { path } => {
                debug!("following soft link '{name}' -> '{path}'");
                self.resolve_from(self.root()?, path, depth + 1)
            }
        }
    }

    /// Link names of a group, across all three storage forms.
    pub fn child_names(&self, group: &DataObject) -> Result<Vec<String>> {
        if group.is_dataset() {
            return Err(HdfError::WrongObjectKind(format!(
                "'{}' is a dataset, not a group",
                group.name
            )));
        }
        let mut names: Vec<String> = group.header.links().map(|l| l.name.clone()).collect();
        if let Some(table) = group.header.symbol_table() {
            names.extend(symbol_table_names(&self.channel, &self.ctx, table)?);
        }
        if let Some(info) = group.header.link_info() {
            names.extend(
                dense_links(&self.channel, &self.ctx, info)?
                    .into_iter()
                    .map(|l| l.name),
            );
        }
        Ok(names)
    }

    /// Resolves `path` and builds the dataset facet used by typed reads.
    pub fn dataset(&self, path: &str) -> Result<Dataset> {
        let object = self.resolve(path)?;
        Dataset::from_object(object)
    }

    /// The exact byte run for elements `[start, start + count)` of the
    /// dataset, flattened row-major.
    pub(crate) fn read_element_range(
        &self,
        dataset: &Dataset,
        start: u64,
        count: u64,
    ) -> Result<Vec<u8>> {
        let element_size = dataset.datatype.size as u64;
        let total = dataset.dataspace.element_count();
        if start + count > total {
            return Err(HdfError::CorruptFile(format!(
                "element range {start}+{count} beyond {total} elements"
            )));
        }
        let byte_count = (count * element_size) as usize;

        match &dataset.layout {
            DataLayout::Compact { data } => {
                let from = (start * element_size) as usize;
                if from + byte_count > data.len() {
                    return Err(HdfError::CorruptFile(
                        "compact layout shorter than its dataspace".into(),
                    ));
                }
                Ok(data[from..from + byte_count].to_vec())
            }
            DataLayout::Contiguous { address, size } => match address {
                Some(address) => {
                    if start * element_size + byte_count as u64 > *size {
                        return Err(HdfError::CorruptFile(
                            "contiguous layout shorter than its dataspace".into(),
                        ));
                    }
                    let block = self
                        .channel
                        .read_block(address + start * element_size, byte_count)?;
                    Ok(block.into_inner())
                }
                None => Ok(dataset.fill_bytes(count)),
            },
            DataLayout::Chunked {
                btree_address,
                chunk_dims,
                element_size: chunk_element_size,
                v1_btree_indexed,
            } => {
                if dataset.filtered {
                    return Err(HdfError::UnsupportedLayout(
                        "chunked dataset with a filter pipeline".into(),
                    ));
                }
                if !v1_btree_indexed {
                    return Err(HdfError::UnsupportedLayout(
                        "chunked dataset with a version 4 chunk index".into(),
                    ));
                }
                if *chunk_element_size as u64 != element_size {
                    return Err(HdfError::CorruptFile(format!(
                        "layout element size {chunk_element_size} disagrees with datatype size {element_size}"
                    )));
                }
                self.read_chunked_range(dataset, *btree_address, chunk_dims, start, count)
            }
            DataLayout::Virtual { .. } => Err(HdfError::UnsupportedLayout(
                "virtual dataset materialization".into(),
            )),
        }
    }

    fn read_chunked_range(
        &self,
        dataset: &Dataset,
        btree_address: Option<u64>,
        chunk_dims: &[u32],
        start: u64,
        count: u64,
    ) -> Result<Vec<u8>> {
        let element_size = dataset.datatype.size as u64;
        let shape = &dataset.dataspace.dimensions;
        let map = dataset.chunk_map(self, btree_address, shape.len())?;

        let chunk_dims: Vec<u64> = chunk_dims.iter().map(|d| *d as u64).collect();
        let chunk_elements: u64 = chunk_dims.iter().product();
        let mut out = Vec::with_capacity((count * element_size) as usize);

        // chunks are reread only when the element walk crosses a tile edge
        let mut cached: Option<(Vec<u64>, Vec<u8>)> = None;
        for flat in start..start + count {
            let coords = crate::data::shape::coords_of(flat, shape);
            let origin: Vec<u64> = coords
                .iter()
                .zip(&chunk_dims)
                .map(|(c, d)| (c / d) * d)
                .collect();

            let hit = match &cached {
                Some((o, _)) if *o == origin => true,
                _ => false,
            };
            if !hit {
                let bytes = match map.get(&origin) {
                    Some(entry) => {
                        if entry.filter_mask != 0 {
                            return Err(HdfError::UnsupportedLayout(
                                "chunk with partially applied filters".into(),
                            ));
                        }
                        self.channel
                            .read_block(entry.address, (chunk_elements * element_size) as usize)?
                            .into_inner()
                    }
                    None => dataset.fill_bytes(chunk_elements),
                };
                cached = Some((origin.clone(), bytes));
            }

            let within: u64 = coords
                .iter()
                .zip(&origin)
                .zip(&chunk_dims)
                .fold(0, |acc, ((c, o), d)| acc * d + (c - o));
            let bytes = &cached.as_ref().unwrap().1;
            let at = (within * element_size) as usize;
            out.extend_from_slice(&bytes[at..at + element_size as usize]);
        }
        Ok(out)
    }

    /// Resolves a variable-length element (global heap collection address
    /// plus object index) to its payload bytes. A zeroed element is the
    /// empty value.
    pub(crate) fn vlen_bytes(&self, element: &[u8]) -> Result<Vec<u8>> {
        let expected = self.ctx.offset_size as usize + 4;
        if element.len() != expected {
            return Err(HdfError::CorruptFile(format!(
                "variable-length element is {} bytes, expected {expected}",
                element.len()
            )));
        }
        let mut cursor = Cursor::new(element.to_vec());
        let address = cursor.read_offset(self.ctx.offset_size)?;
        let index = cursor.read_u32::<LittleEndian>()?;
        match address {
            None => Ok(Vec::new()),
            Some(0) => Ok(Vec::new()),
            Some(address) => {
                self.global_heap
                    .object_bytes(&self.channel, &self.ctx, address, index as u16)
            }
        }
    }

    /// Follows an object reference (a file offset of offset-size bytes) to
    /// the referenced object.
    pub fn dereference(&self, raw: &[u8]) -> Result<Arc<DataObject>> {
        let mut cursor = Cursor::new(raw.to_vec());
        let address = cursor
            .read_offset(self.ctx.offset_size)?
            .ok_or(HdfError::Undefined)?;
        self.object_at(address, "<referenced>")
    }

    /// Decodes a region reference: the referenced object plus the stored
    /// selection, read from the global heap.
    pub fn dereference_region(&self, raw: &[u8]) -> Result<(Arc<DataObject>, Selection)> {
        let mut cursor = Cursor::new(raw.to_vec());
        let heap_address = cursor
            .read_offset(self.ctx.offset_size)?
            .ok_or(HdfError::Undefined)?;
        let index = cursor.read_u32::<LittleEndian>()?;
        let payload =
            self.global_heap
                .object_bytes(&self.channel, &self.ctx, heap_address, index as u16)?;
        let mut payload = Cursor::new(payload);
        let address = payload
            .read_offset(self.ctx.offset_size)?
            .ok_or(HdfError::Undefined)?;
        let selection = Selection::read(&mut payload)?;
        Ok((self.object_at(address, "<referenced>")?, selection))
    }

    /// Decodes the source list of a virtual dataset. The descriptor lives
    /// in the global heap; materializing the data itself is unsupported.
    pub fn virtual_sources(&self, dataset: &Dataset) -> Result<Vec<VirtualSource>> {
        let DataLayout::Virtual { heap_address, index } = &dataset.layout else {
            return Err(HdfError::WrongObjectKind(format!(
                "'{}' does not use a virtual layout",
                dataset.object.name
            )));
        };
        let address = heap_address.ok_or(HdfError::Undefined)?;
        let payload =
            self.global_heap
                .object_bytes(&self.channel, &self.ctx, address, *index as u16)?;
        VirtualSource::parse_descriptor(&payload)
    }
}

/// A resolved dataset: its object plus the decoded datatype, dataspace and
/// layout facets, and the lazily built chunk index.
pub struct Dataset {
    pub object: Arc<DataObject>,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub layout: DataLayout,
    pub filtered: bool,
    pub fill_value: Option<Vec<u8>>,
    chunks: Mutex<Option<Arc<ChunkMap>>>,
}

pub(crate) type ChunkMap = HashMap<Vec<u64>, btree::ChunkEntry>;

impl Dataset {
    pub fn from_object(object: Arc<DataObject>) -> Result<Dataset> {
        let header = &object.header;
        let (Some(datatype), Some(dataspace), Some(layout)) =
            (header.datatype(), header.dataspace(), header.layout())
        else {
            return Err(HdfError::WrongObjectKind(format!(
                "'{}' is not a dataset",
                object.name
            )));
        };
        let datatype = datatype.clone();
        let dataspace = dataspace.clone();
        let layout = layout.clone();
        let filtered = header
            .filters()
            .map(|f| !f.filters.is_empty())
            .unwrap_or(false);
        let fill_value = header.fill_value().and_then(|f| f.value.clone());
        Ok(Dataset {
            object,
            datatype,
            dataspace,
            layout,
            filtered,
            fill_value,
            chunks: Mutex::new(None),
        })
    }

    pub fn rank(&self) -> usize {
        self.dataspace.rank()
    }

    pub fn shape(&self) -> &[u64] {
        &self.dataspace.dimensions
    }

    pub fn element_count(&self) -> u64 {
        self.dataspace.element_count()
    }

    /// `count` elements of fill value, zeros when none is recorded.
    fn fill_bytes(&self, count: u64) -> Vec<u8> {
        let element_size = self.datatype.size as usize;
        match &self.fill_value {
            Some(fill) if fill.len() == element_size => {
                fill.iter().copied().cycle().take(count as usize * element_size).collect()
            }
            _ => vec![0u8; count as usize * element_size],
        }
    }

    fn chunk_map(
        &self,
        file: &H5File,
        btree_address: Option<u64>,
        rank: usize,
    ) -> Result<Arc<ChunkMap>> {
        if let Some(map) = self.chunks.lock().expect("chunk index poisoned").as_ref() {
            return Ok(Arc::clone(map));
        }
        let mut map = ChunkMap::new();
        if let Some(address) = btree_address {
            for entry in btree::collect_chunks(file.channel(), file.context(), address, rank)? {
                map.insert(entry.offsets.clone(), entry);
            }
        }
        debug!(
            "built chunk index for '{}': {} chunks",
            self.object.name,
            map.len()
        );
        let map = Arc::new(map);
        *self.chunks.lock().expect("chunk index poisoned") = Some(Arc::clone(&map));
        Ok(map)
    }
}

/// One mapping entry of a virtual dataset: where the bytes would come from.
///
/// The descriptor is a global heap object: a version byte (1), a 4-byte
/// entry count, then per entry the source file name and dataset path as
/// NUL-terminated strings followed by the source and virtual selections.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualSource {
    pub source_file: String,
    pub source_dataset: String,
    pub source_selection: Selection,
    pub virtual_selection: Selection,
}

impl VirtualSource {
    pub(crate) fn parse_descriptor(payload: &[u8]) -> Result<Vec<VirtualSource>> {
        let mut block = Cursor::new(payload.to_vec());
        let version = block.read_u8()?;
        if version != 1 {
            return Err(HdfError::UnsupportedVersion {
                entity: "virtual dataset descriptor",
                version,
            });
        }
        let count = block.read_u32::<LittleEndian>()?;
        let mut sources = Vec::with_capacity(count as usize);
        for _ in 0..count {
            sources.push(VirtualSource {
                source_file: block.read_null_terminated_string()?,
                source_dataset: block.read_null_terminated_string()?,
                source_selection: Selection::read(&mut block)?,
                virtual_selection: Selection::read(&mut block)?,
            });
        }
        Ok(sources)
    }
}
