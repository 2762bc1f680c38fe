//! Minimal write path: one file, one contiguous compound dataset under the
//! root group, classic symbol-table link storage, one scalar
//! variable-length string attribute. The inverse of the read path for
//! exactly this shape of file; everything else stays read-only.

use std::path::Path;

use crate::format::{CharacterSet, FormatContext, HdfError, Result, StringPadding, SIGNATURE};

use super::encode;

/// Storage description of one compound member. Members are laid out in
/// declaration order with no padding beyond what their sizes dictate.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A fixed-point word, written as stored: for packed members the
    /// caller supplies the raw word and owns the sub-word interpretation.
    Fixed {
        size: u8,
        signed: bool,
        bit_offset: u16,
        bit_precision: u16,
    },
    Float32,
    Float64,
    /// NUL-padded string of exactly `len` bytes.
    FixedString { len: u32 },
    /// Variable-length UTF-8 string; the value goes to the global heap and
    /// the record stores the collection address and object index.
    VarString,
}

impl FieldKind {
    pub fn int(size: u8) -> FieldKind {
        FieldKind::Fixed {
            size,
            signed: true,
            bit_offset: 0,
            bit_precision: size as u16 * 8,
        }
    }

    pub fn uint(size: u8) -> FieldKind {
        FieldKind::Fixed {
            size,
            signed: false,
            bit_offset: 0,
            bit_precision: size as u16 * 8,
        }
    }

    fn byte_size(&self, ctx: &FormatContext) -> u32 {
        match self {
            FieldKind::Fixed { size, .. } => *size as u32,
            FieldKind::Float32 => 4,
            FieldKind::Float64 => 8,
            FieldKind::FixedString { len } => *len,
            FieldKind::VarString => ctx.offset_size as u32 + 4,
        }
    }

    fn datatype_message(&self, ctx: &FormatContext) -> Vec<u8> {
        match self {
            FieldKind::Fixed {
                size,
                signed,
                bit_offset,
                bit_precision,
            } => encode::fixed_point(*size as u32, *signed, *bit_offset, *bit_precision),
            FieldKind::Float32 => encode::float_f32(),
            FieldKind::Float64 => encode::float_f64(),
            FieldKind::FixedString { len } => {
                encode::string(*len, StringPadding::NullPad, CharacterSet::Ascii)
            }
            FieldKind::VarString => encode::vlen_string(ctx),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            kind,
        }
    }
}

/// One record value, index-aligned with the field list.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Uint(u64),
    F32(f32),
    F64(f64),
    Str(String),
}

const DEFAULT_ATTRIBUTE_NAME: &str = "GIT root revision";

/// Writes a standard classic-format file: version 0 superblock with 8-byte
/// offsets and lengths, a root group linked through a symbol table, and a
/// single contiguous compound dataset.
pub struct CompoundFileWriter {
    dataset_name: String,
    fields: Vec<FieldSpec>,
    attribute: Option<(String, String)>,
    ctx: FormatContext,
}

impl CompoundFileWriter {
    pub fn new(dataset_name: &str, fields: Vec<FieldSpec>) -> Result<CompoundFileWriter> {
        if dataset_name.is_empty() || dataset_name.contains('/') {
            return Err(HdfError::NotFound(format!(
                "'{dataset_name}' is not a legal dataset name"
            )));
        }
        if fields.is_empty() {
            return Err(HdfError::UnsupportedDatatype(
                "a compound dataset needs at least one member".into(),
            ));
        }
        Ok(CompoundFileWriter {
            dataset_name: dataset_name.to_string(),
            fields,
            attribute: None,
            ctx: FormatContext {
                offset_size: 8,
                length_size: 8,
            },
        })
    }

    /// Attaches the scalar variable-length string attribute; the
    /// conventional name records the source revision.
    pub fn with_attribute(mut self, value: &str) -> CompoundFileWriter {
        self.attribute = Some((DEFAULT_ATTRIBUTE_NAME.to_string(), value.to_string()));
        self
    }

    pub fn with_named_attribute(mut self, name: &str, value: &str) -> CompoundFileWriter {
        self.attribute = Some((name.to_string(), value.to_string()));
        self
    }

    pub fn write_to(&self, path: impl AsRef<Path>, records: &[Vec<Value>]) -> Result<()> {
        let bytes = self.to_bytes(records)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Serializes the whole file image.
    pub fn to_bytes(&self, records: &[Vec<Value>]) -> Result<Vec<u8>> {
        let record_size: u32 = self
            .fields
            .iter()
            .map(|f| f.kind.byte_size(&self.ctx))
            .sum();

        // member offsets are the running size sum: no interior padding
        let mut offset = 0u32;
        let mut members = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            members.push((
                field.name.as_str(),
                offset,
                field.kind.datatype_message(&self.ctx),
            ));
            offset += field.kind.byte_size(&self.ctx);
        }
        if offset != record_size {
            return Err(HdfError::CorruptFile(format!(
                "member sizes sum to {offset}, compound declares {record_size}"
            )));
        }
        let datatype_message = encode::compound(record_size, &members);

        // global heap payloads: the attribute value first, then every
        // variable-length field in record-major order
        let mut heap_payloads: Vec<Vec<u8>> = Vec::new();
        if let Some((_, value)) = &self.attribute {
            heap_payloads.push(value.as_bytes().to_vec());
        }
        for (row, record) in records.iter().enumerate() {
            if record.len() != self.fields.len() {
                return Err(HdfError::ValueOutOfRange {
                    target: "record",
                    value: format!("record {row} has {} values, schema has {}", record.len(), self.fields.len()),
                });
            }
            for (field, value) in self.fields.iter().zip(record) {
                if let (FieldKind::VarString, Value::Str(s)) = (&field.kind, value) {
                    heap_payloads.push(s.as_bytes().to_vec());
                }
            }
        }

        // section sizes
        let heap_segment = 8 + padded8(self.dataset_name.len() + 1);
        let dataspace_payload = 16usize;
        let layout_payload = 18usize;
        let attribute_payload = self.attribute.as_ref().map(|(name, _)| {
            8 + padded8(name.len() + 1) + padded8(20) + 8 + 12
        });
        let mut header_messages_len = (8 + dataspace_payload)
            + (8 + padded8(datatype_message.len()))
            + (8 + padded8(layout_payload));
        if let Some(attr) = attribute_payload {
            header_messages_len += 8 + padded8(attr);
        }
        let global_heap_size: usize = 16
            + heap_payloads
                .iter()
                .map(|p| 16 + padded8(p.len()))
                .sum::<usize>();

        // section addresses, in file order
        let a_root_header = 96u64;
        let a_btree = a_root_header + 40;
        let a_local_heap = a_btree + 48;
        let a_heap_segment = a_local_heap + 32;
        let a_symbol_node = a_heap_segment + heap_segment as u64;
        let a_dataset_header = a_symbol_node + 48;
        let a_global_heap = a_dataset_header + 16 + header_messages_len as u64;
        let a_data = a_global_heap + global_heap_size as u64;
        let eof = a_data + records.len() as u64 * record_size as u64;

        let mut out = Vec::with_capacity(eof as usize);
        self.put_superblock(&mut out, a_root_header, a_btree, a_local_heap, eof);
        debug_assert_eq!(out.len() as u64, a_root_header);

        // root group object header: one symbol table message
        self.put_v1_header_prefix(&mut out, 1, 24);
        let mut symbol_table = Vec::with_capacity(16);
        symbol_table.extend_from_slice(&a_btree.to_le_bytes());
        symbol_table.extend_from_slice(&a_local_heap.to_le_bytes());
        put_message(&mut out, 0x0011, &symbol_table);
        debug_assert_eq!(out.len() as u64, a_btree);

        // group B-tree: a single leaf entry pointing at the symbol node
        out.extend_from_slice(b"TREE");
        out.push(0); // group node
        out.push(0); // leaf
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&[0xff; 8]); // left sibling
        out.extend_from_slice(&[0xff; 8]); // right sibling
        out.extend_from_slice(&0u64.to_le_bytes()); // key 0: heap offset 0
        out.extend_from_slice(&a_symbol_node.to_le_bytes());
        out.extend_from_slice(&8u64.to_le_bytes()); // key 1: the dataset name
        debug_assert_eq!(out.len() as u64, a_local_heap);

        // local heap: the empty string, then the dataset name at offset 8
        out.extend_from_slice(b"HEAP");
        out.push(0);
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&(heap_segment as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&a_heap_segment.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&encode::padded_name(&self.dataset_name));
        debug_assert_eq!(out.len() as u64, a_symbol_node);

        // symbol table node with the dataset entry
        out.extend_from_slice(b"SNOD");
        out.push(1);
        out.push(0);
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&8u64.to_le_bytes()); // link name offset
        out.extend_from_slice(&a_dataset_header.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // cache type
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&[0u8; 16]);
        debug_assert_eq!(out.len() as u64, a_dataset_header);

        // dataset object header
        let message_count = 3 + u16::from(self.attribute.is_some());
        self.put_v1_header_prefix(&mut out, message_count, header_messages_len as u32);

        let mut dataspace = Vec::with_capacity(dataspace_payload);
        dataspace.push(1); // version
        dataspace.push(1); // rank
        dataspace.push(0); // flags
        dataspace.extend_from_slice(&[0; 5]);
        dataspace.extend_from_slice(&(records.len() as u64).to_le_bytes());
        put_message(&mut out, 0x0001, &dataspace);

        put_message(&mut out, 0x0003, &datatype_message);

        let mut layout = Vec::with_capacity(layout_payload);
        layout.push(3); // version
        layout.push(1); // contiguous
        layout.extend_from_slice(&a_data.to_le_bytes());
        layout.extend_from_slice(&(records.len() as u64 * record_size as u64).to_le_bytes());
        put_message(&mut out, 0x0008, &layout);

        if let Some((name, _)) = &self.attribute {
            let mut attribute = Vec::new();
            attribute.push(1); // version
            attribute.push(0);
            attribute.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
            attribute.extend_from_slice(&20u16.to_le_bytes()); // datatype size
            attribute.extend_from_slice(&8u16.to_le_bytes()); // dataspace size
            attribute.extend_from_slice(&encode::padded_name(name));
            let mut vlen = encode::vlen_string(&self.ctx);
            vlen.resize(padded8(vlen.len()), 0);
            attribute.extend_from_slice(&vlen);
            attribute.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]); // scalar dataspace
            attribute.extend_from_slice(&a_global_heap.to_le_bytes());
            attribute.extend_from_slice(&1u32.to_le_bytes()); // heap object 1
            put_message(&mut out, 0x000c, &attribute);
        }
        debug_assert_eq!(out.len() as u64, a_global_heap);

        // global heap collection
        out.extend_from_slice(b"GCOL");
        out.push(1);
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&(global_heap_size as u64).to_le_bytes());
        for (i, payload) in heap_payloads.iter().enumerate() {
            out.extend_from_slice(&((i + 1) as u16).to_le_bytes());
            out.extend_from_slice(&1u16.to_le_bytes());
            out.extend_from_slice(&[0; 4]);
            out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            out.extend_from_slice(payload);
            out.resize(out.len() + padded8(payload.len()) - payload.len(), 0);
        }
        debug_assert_eq!(out.len() as u64, a_data);

        // record data
        let mut heap_index = if self.attribute.is_some() { 2u32 } else { 1u32 };
        for record in records {
            for (field, value) in self.fields.iter().zip(record) {
                self.put_value(&mut out, field, value, a_global_heap, &mut heap_index)?;
            }
        }
        debug_assert_eq!(out.len() as u64, eof);

        Ok(out)
    }

    fn put_superblock(
        &self,
        out: &mut Vec<u8>,
        root_header: u64,
        btree: u64,
        local_heap: u64,
        eof: u64,
    ) {
        out.extend_from_slice(&SIGNATURE);
        out.extend_from_slice(&[0, 0, 0, 0, 0]); // versions and reserved
        out.push(self.ctx.offset_size);
        out.push(self.ctx.length_size);
        out.push(0);
        out.extend_from_slice(&4u16.to_le_bytes()); // group leaf K
        out.extend_from_slice(&16u16.to_le_bytes()); // group internal K
        out.extend_from_slice(&0u32.to_le_bytes()); // consistency flags
        out.extend_from_slice(&0u64.to_le_bytes()); // base address
        out.extend_from_slice(&[0xff; 8]); // free space: undefined
        out.extend_from_slice(&eof.to_le_bytes());
        out.extend_from_slice(&[0xff; 8]); // driver info: undefined
        // root symbol table entry, group addresses cached
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&root_header.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&btree.to_le_bytes());
        out.extend_from_slice(&local_heap.to_le_bytes());
    }

    fn put_v1_header_prefix(&self, out: &mut Vec<u8>, messages: u16, size: u32) {
        out.push(1);
        out.push(0);
        out.extend_from_slice(&messages.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // reference count
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
    }

    fn put_value(
        &self,
        out: &mut Vec<u8>,
        field: &FieldSpec,
        value: &Value,
        heap_address: u64,
        heap_index: &mut u32,
    ) -> Result<()> {
        match (&field.kind, value) {
            (FieldKind::Fixed { size, signed, .. }, Value::Int(v)) => {
                put_fixed(out, field, *v as i128, *size, *signed)
            }
            (FieldKind::Fixed { size, signed, .. }, Value::Uint(v)) => {
                put_fixed(out, field, *v as i128, *size, *signed)
            }
            (FieldKind::Float32, Value::F32(v)) => {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            }
            (FieldKind::Float64, Value::F64(v)) => {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            }
            (FieldKind::FixedString { len }, Value::Str(s)) => {
                if s.len() > *len as usize {
                    return Err(HdfError::ValueOutOfRange {
                        target: "fixed string",
                        value: format!("'{s}' exceeds {len} bytes in '{}'", field.name),
                    });
                }
                out.extend_from_slice(s.as_bytes());
                out.resize(out.len() + *len as usize - s.len(), 0);
                Ok(())
            }
            (FieldKind::VarString, Value::Str(_)) => {
                out.extend_from_slice(&heap_address.to_le_bytes());
                out.extend_from_slice(&heap_index.to_le_bytes());
                *heap_index += 1;
                Ok(())
            }
            _ => Err(HdfError::ValueOutOfRange {
                target: "record value",
                value: format!("{value:?} does not match field '{}'", field.name),
            }),
        }
    }
}

fn put_fixed(out: &mut Vec<u8>, field: &FieldSpec, v: i128, size: u8, signed: bool) -> Result<()> {
    let bits = size as u32 * 8;
    let in_range = if signed {
        let min = -(1i128 << (bits - 1));
        let max = (1i128 << (bits - 1)) - 1;
        v >= min && v <= max
    } else {
        v >= 0 && (bits == 128 || v < (1i128 << bits))
    };
    if !in_range {
        return Err(HdfError::ValueOutOfRange {
            target: "fixed-point field",
            value: format!("{v} does not fit {bits} bits in '{}'", field.name),
        });
    }
    out.extend_from_slice(&v.to_le_bytes()[..size as usize]);
    Ok(())
}

fn put_message(out: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let padded = padded8(payload.len());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&(padded as u16).to_le_bytes());
    out.push(0); // flags
    out.extend_from_slice(&[0; 3]);
    out.extend_from_slice(payload);
    out.resize(out.len() + padded - payload.len(), 0);
}

fn padded8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::H5File;

    fn schema() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", FieldKind::uint(8)),
            FieldSpec::new("label", FieldKind::FixedString { len: 6 }),
            FieldSpec::new("note", FieldKind::VarString),
            FieldSpec::new("weight", FieldKind::Float64),
        ]
    }

    fn record(id: u64, label: &str, note: &str, weight: f64) -> Vec<Value> {
        vec![
            Value::Uint(id),
            Value::Str(label.to_string()),
            Value::Str(note.to_string()),
            Value::F64(weight),
        ]
    }

    #[test]
    fn written_image_opens_and_resolves() {
        let writer = CompoundFileWriter::new("records", schema())
            .unwrap()
            .with_attribute("deadbeef");
        let image = writer
            .to_bytes(&[record(1, "one", "first note", 1.5), record(2, "two", "second", 2.5)])
            .unwrap();

        let file = H5File::from_bytes(image).unwrap();
        let dataset = file.dataset("/records").unwrap();
        assert_eq!(dataset.shape(), &[2]);
        assert_eq!(dataset.datatype.size, 8 + 6 + 12 + 8);

        let object = file.resolve("/records").unwrap();
        let revision: String = file.attribute_scalar(&object, "GIT root revision").unwrap();
        assert_eq!(revision, "deadbeef");
    }

    #[test]
    fn member_values_roundtrip() {
        let writer = CompoundFileWriter::new("records", schema()).unwrap();
        let image = writer
            .to_bytes(&[record(7, "seven", "lucky", 7.75)])
            .unwrap();
        let file = H5File::from_bytes(image).unwrap();
        let source = file.data_source::<Vec<u8>>("/records").unwrap();
        let raw = source.read_vector().unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(u64::from_le_bytes(raw[0][..8].try_into().unwrap()), 7);
        assert_eq!(&raw[0][8..13], b"seven");
    }

    #[test]
    fn mismatched_value_is_rejected() {
        let writer = CompoundFileWriter::new("records", schema()).unwrap();
        let bad = vec![
            Value::Str("seven".into()),
            Value::Str("x".into()),
            Value::Str("y".into()),
            Value::F64(0.0),
        ];
        assert!(matches!(
            writer.to_bytes(&[bad]),
            Err(HdfError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn fixed_overflow_is_rejected() {
        let fields = vec![FieldSpec::new("v", FieldKind::int(1))];
        let writer = CompoundFileWriter::new("d", fields).unwrap();
        assert!(writer.to_bytes(&[vec![Value::Int(127)]]).is_ok());
        assert!(matches!(
            writer.to_bytes(&[vec![Value::Int(128)]]),
            Err(HdfError::ValueOutOfRange { .. })
        ));
    }
}
