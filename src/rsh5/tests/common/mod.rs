//! Test-side image builder: classic single-dataset files with arbitrary
//! datatypes, shapes and layouts. The public writer only covers compound
//! contiguous datasets, so the reader scenarios build their inputs here,
//! byte by byte, the way the on-disk format defines them.

#![allow(dead_code)]

use rsh5::encode;

pub const SIGNATURE: [u8; 8] = [0x89, 0x48, 0x44, 0x46, 0x0d, 0x0a, 0x1a, 0x0a];

pub enum TestData {
    Contiguous(Vec<u8>),
    ContiguousUnallocated,
    Compact(Vec<u8>),
    /// Chunk origin coordinates (element offsets) and the chunk bytes.
    Chunked {
        chunk_dims: Vec<u32>,
        chunks: Vec<(Vec<u64>, Vec<u8>)>,
    },
    /// Raw virtual-mapping descriptor placed in the global heap.
    Virtual(Vec<u8>),
}

pub struct TestFile {
    pub offset_size: u8,
    pub length_size: u8,
    pub dataset_name: String,
    /// Complete datatype message payload.
    pub datatype: Vec<u8>,
    pub element_size: u32,
    /// Empty for a scalar dataspace.
    pub shape: Vec<u64>,
    pub data: TestData,
    /// Extra global heap payloads, assigned object indexes 1, 2, ...
    /// (after the virtual descriptor, when present).
    pub heap_objects: Vec<Vec<u8>>,
    /// Fill value bytes carried in a fill value message.
    pub fill_value: Option<Vec<u8>>,
    /// Add a one-entry deflate filter pipeline message.
    pub filtered: bool,
}

impl TestFile {
    pub fn new(name: &str, datatype: Vec<u8>, element_size: u32, shape: Vec<u64>, data: TestData) -> TestFile {
        TestFile {
            offset_size: 8,
            length_size: 8,
            dataset_name: name.to_string(),
            datatype,
            element_size,
            shape,
            data,
            heap_objects: Vec::new(),
            fill_value: None,
            filtered: false,
        }
    }

    fn put_offset(&self, out: &mut Vec<u8>, value: u64) {
        out.extend_from_slice(&value.to_le_bytes()[..self.offset_size as usize]);
    }

    fn put_length(&self, out: &mut Vec<u8>, value: u64) {
        out.extend_from_slice(&value.to_le_bytes()[..self.length_size as usize]);
    }

    fn put_undefined_offset(&self, out: &mut Vec<u8>) {
        out.extend(std::iter::repeat(0xffu8).take(self.offset_size as usize));
    }

    fn put_message(&self, out: &mut Vec<u8>, kind: u16, payload: &[u8]) {
        let padded = padded8(payload.len());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&(padded as u16).to_le_bytes());
        out.push(0);
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(payload);
        out.resize(out.len() + padded - payload.len(), 0);
    }

    /// Serializes the image. Section order: superblock, root header,
    /// group B-tree, local heap, symbol node, dataset header,
    /// global heap, chunk B-tree, chunk/contiguous data.
    pub fn build(&self) -> Vec<u8> {
        let o = self.offset_size as usize;
        let l = self.length_size as usize;

        // --- message payloads (addresses patched in later) ---
        let mut dataspace = vec![1u8, self.shape.len() as u8, 0];
        dataspace.extend_from_slice(&[0; 5]);
        for dim in &self.shape {
            dataspace.extend_from_slice(&dim.to_le_bytes()[..l]);
        }

        let fill_message = self.fill_value.as_ref().map(|fill| {
            let mut payload = vec![2u8, 2, 2, 1];
            payload.extend_from_slice(&(fill.len() as u32).to_le_bytes());
            payload.extend_from_slice(fill);
            payload
        });

        let filter_message = self.filtered.then(|| {
            // version 2, one filter: deflate with one client value
            let mut payload = vec![2u8, 1];
            payload.extend_from_slice(&1u16.to_le_bytes()); // id
            payload.extend_from_slice(&1u16.to_le_bytes()); // flags
            payload.extend_from_slice(&1u16.to_le_bytes()); // value count
            payload.extend_from_slice(&6u32.to_le_bytes());
            payload
        });

        let layout_len = match &self.data {
            TestData::Compact(bytes) => 2 + 2 + bytes.len(),
            TestData::Contiguous(_) | TestData::ContiguousUnallocated => 2 + o + l,
            TestData::Chunked { chunk_dims, .. } => 3 + o + 4 * (chunk_dims.len() + 1),
            TestData::Virtual(_) => 2 + o + 4,
        };

        let mut messages_len = (8 + padded8(dataspace.len())) + (8 + padded8(self.datatype.len()));
        if let Some(fill) = &fill_message {
            messages_len += 8 + padded8(fill.len());
        }
        if let Some(filter) = &filter_message {
            messages_len += 8 + padded8(filter.len());
        }
        messages_len += 8 + padded8(layout_len);

        // --- section addresses ---
        let superblock_len = 8 + 16 + 4 * o + (2 * o + 24);
        let a_root_header = superblock_len as u64;
        let a_btree = a_root_header + 16 + 8 + padded8(2 * o) as u64;
        let btree_len = 8 + 2 * o + l + (o + l);
        let a_local_heap = a_btree + btree_len as u64;
        let heap_segment = 8 + padded8(self.dataset_name.len() + 1);
        let a_heap_segment = a_local_heap + (8 + 2 * l + o) as u64;
        let a_symbol_node = a_heap_segment + heap_segment as u64;
        let a_dataset_header = a_symbol_node + 8 + (2 * o + 24) as u64;
        let a_global_heap = a_dataset_header + 16 + messages_len as u64;

        let mut heap_payloads: Vec<Vec<u8>> = Vec::new();
        if let TestData::Virtual(descriptor) = &self.data {
            heap_payloads.push(descriptor.clone());
        }
        heap_payloads.extend(self.heap_objects.iter().cloned());
        let global_heap_len: usize = if heap_payloads.is_empty() {
            0
        } else {
            8 + l + heap_payloads
                .iter()
                .map(|p| 8 + l + padded8(p.len()))
                .sum::<usize>()
        };

        let a_after_heap = a_global_heap + global_heap_len as u64;
        // chunk B-tree (single leaf node), then chunk data
        let (a_chunk_btree, a_data) = match &self.data {
            TestData::Chunked { chunk_dims, chunks } => {
                let key_len = 8 + 8 * (chunk_dims.len() + 1);
                let node_len = 8 + 2 * o + key_len + chunks.len() * (o + key_len);
                (a_after_heap, a_after_heap + node_len as u64)
            }
            _ => (a_after_heap, a_after_heap),
        };

        let data_len: u64 = match &self.data {
            TestData::Contiguous(bytes) => bytes.len() as u64,
            TestData::Chunked { chunks, .. } => chunks.iter().map(|(_, b)| b.len() as u64).sum(),
            _ => 0,
        };
        let eof = a_data + data_len;

        // --- emit ---
        let mut out = Vec::with_capacity(eof as usize);

        // superblock, version 0
        out.extend_from_slice(&SIGNATURE);
        out.extend_from_slice(&[0, 0, 0, 0, 0]);
        out.push(self.offset_size);
        out.push(self.length_size);
        out.push(0);
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        self.put_offset(&mut out, 0);
        self.put_undefined_offset(&mut out);
        self.put_offset(&mut out, eof);
        self.put_undefined_offset(&mut out);
        // root symbol table entry
        self.put_offset(&mut out, 0);
        self.put_offset(&mut out, a_root_header);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        let scratch_at = out.len();
        self.put_offset(&mut out, a_btree);
        self.put_offset(&mut out, a_local_heap);
        out.resize(scratch_at + 16, 0);
        assert_eq!(out.len() as u64, a_root_header);

        // root object header: symbol table message
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&((8 + padded8(2 * o)) as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        let mut symbol_table = Vec::new();
        self.put_offset(&mut symbol_table, a_btree);
        self.put_offset(&mut symbol_table, a_local_heap);
        self.put_message(&mut out, 0x0011, &symbol_table);
        assert_eq!(out.len() as u64, a_btree);

        // group B-tree leaf with one child
        out.extend_from_slice(b"TREE");
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&1u16.to_le_bytes());
        self.put_undefined_offset(&mut out);
        self.put_undefined_offset(&mut out);
        self.put_length(&mut out, 0);
        self.put_offset(&mut out, a_symbol_node);
        self.put_length(&mut out, 8);
        assert_eq!(out.len() as u64, a_local_heap);

        // local heap
        out.extend_from_slice(b"HEAP");
        out.push(0);
        out.extend_from_slice(&[0; 3]);
        self.put_length(&mut out, heap_segment as u64);
        self.put_length(&mut out, 0);
        self.put_offset(&mut out, a_heap_segment);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&padded_name(&self.dataset_name));
        assert_eq!(out.len() as u64, a_symbol_node);

        // symbol table node
        out.extend_from_slice(b"SNOD");
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&1u16.to_le_bytes());
        self.put_offset(&mut out, 8);
        self.put_offset(&mut out, a_dataset_header);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&[0; 16]);
        assert_eq!(out.len() as u64, a_dataset_header);

        // dataset object header
        let mut message_count = 3u16;
        if fill_message.is_some() {
            message_count += 1;
        }
        if filter_message.is_some() {
            message_count += 1;
        }
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&message_count.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(messages_len as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);

        self.put_message(&mut out, 0x0001, &dataspace);
        self.put_message(&mut out, 0x0003, &self.datatype);
        if let Some(fill) = &fill_message {
            self.put_message(&mut out, 0x0005, fill);
        }
        if let Some(filter) = &filter_message {
            self.put_message(&mut out, 0x000b, filter);
        }

        let mut layout = Vec::with_capacity(layout_len);
        match &self.data {
            TestData::Compact(bytes) => {
                layout.extend_from_slice(&[3, 0]);
                layout.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                layout.extend_from_slice(bytes);
            }
            TestData::Contiguous(bytes) => {
                layout.extend_from_slice(&[3, 1]);
                let mut address = Vec::new();
                self.put_offset(&mut address, a_data);
                layout.extend_from_slice(&address);
                let mut size = Vec::new();
                self.put_length(&mut size, bytes.len() as u64);
                layout.extend_from_slice(&size);
            }
            TestData::ContiguousUnallocated => {
                layout.extend_from_slice(&[3, 1]);
                layout.extend(std::iter::repeat(0xffu8).take(o));
                let mut size = Vec::new();
                self.put_length(&mut size, 0);
                layout.extend_from_slice(&size);
            }
            TestData::Chunked { chunk_dims, .. } => {
                layout.extend_from_slice(&[3, 2]);
                layout.push(chunk_dims.len() as u8 + 1);
                let mut address = Vec::new();
                self.put_offset(&mut address, a_chunk_btree);
                layout.extend_from_slice(&address);
                for dim in chunk_dims {
                    layout.extend_from_slice(&dim.to_le_bytes());
                }
                layout.extend_from_slice(&self.element_size.to_le_bytes());
            }
            TestData::Virtual(_) => {
                layout.extend_from_slice(&[4, 3]);
                let mut address = Vec::new();
                self.put_offset(&mut address, a_global_heap);
                layout.extend_from_slice(&address);
                layout.extend_from_slice(&1u32.to_le_bytes());
            }
        }
        self.put_message(&mut out, 0x0008, &layout);
        assert_eq!(out.len() as u64, a_global_heap);

        // global heap collection
        if !heap_payloads.is_empty() {
            out.extend_from_slice(b"GCOL");
            out.push(1);
            out.extend_from_slice(&[0; 3]);
            self.put_length(&mut out, global_heap_len as u64);
            for (i, payload) in heap_payloads.iter().enumerate() {
                out.extend_from_slice(&((i + 1) as u16).to_le_bytes());
                out.extend_from_slice(&1u16.to_le_bytes());
                out.extend_from_slice(&[0; 4]);
                self.put_length(&mut out, payload.len() as u64);
                out.extend_from_slice(payload);
                out.resize(out.len() + padded8(payload.len()) - payload.len(), 0);
            }
        }
        assert_eq!(out.len() as u64, a_chunk_btree);

        // chunk index and data
        match &self.data {
            TestData::Chunked { chunk_dims, chunks } => {
                out.extend_from_slice(b"TREE");
                out.push(1);
                out.push(0);
                out.extend_from_slice(&(chunks.len() as u16).to_le_bytes());
                self.put_undefined_offset(&mut out);
                self.put_undefined_offset(&mut out);
                let mut chunk_address = a_data;
                for (origin, bytes) in chunks {
                    assert_eq!(origin.len(), chunk_dims.len());
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                    for offset in origin {
                        out.extend_from_slice(&offset.to_le_bytes());
                    }
                    out.extend_from_slice(&0u64.to_le_bytes());
                    self.put_offset(&mut out, chunk_address);
                    chunk_address += bytes.len() as u64;
                }
                // trailing key after the last child
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                for _ in 0..=chunk_dims.len() {
                    out.extend_from_slice(&0u64.to_le_bytes());
                }
                assert_eq!(out.len() as u64, a_data);
                for (_, bytes) in chunks {
                    out.extend_from_slice(bytes);
                }
            }
            TestData::Contiguous(bytes) => out.extend_from_slice(bytes),
            _ => {}
        }
        assert_eq!(out.len() as u64, eof);
        out
    }
}

pub fn padded8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

pub fn padded_name(name: &str) -> Vec<u8> {
    let mut out = name.as_bytes().to_vec();
    out.push(0);
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

/// A variable-length element: collection address plus object index, in the
/// given offset width.
pub fn vlen_element(offset_size: u8, collection: u64, index: u32) -> Vec<u8> {
    let mut out = collection.to_le_bytes()[..offset_size as usize].to_vec();
    out.extend_from_slice(&index.to_le_bytes());
    out
}

/// Convenience wrappers over the crate's datatype emitters.
pub fn i32_datatype() -> Vec<u8> {
    encode::fixed_point(4, true, 0, 32)
}

pub fn f64_datatype() -> Vec<u8> {
    encode::float_f64()
}

pub fn le_bytes_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn le_bytes_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
