use num_enum::TryFromPrimitive;

use super::*;

/// # [IV.A.2.d] The Datatype Message
///
/// Every datatype starts with the same 8-byte header:
///
/// | Size | Field |
/// | ---- | ----- |
/// | 1    | Class and version: the version in the top four bits, the class in the bottom four |
/// | 3    | Class bit field, little-endian, interpreted per class |
/// | 4    | Size of one element in bytes |
/// | -    | Properties, class-specific |
///
/// The `size` reported here is the exact number of bytes one element of the
/// datatype occupies in dataset storage; the properties that follow may be
/// longer or shorter than `size` (a compound's member descriptors usually
/// are longer).
///
/// [IV.A.2.d]: https://support.hdfgroup.org/documentation/hdf5/latest/_f_m_t3.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum DatatypeClass {
    FixedPoint = 0,
    FloatingPoint = 1,
    Time = 2,
    String = 3,
    BitField = 4,
    Opaque = 5,
    Compound = 6,
    Reference = 7,
    Enum = 8,
    VariableLength = 9,
    Array = 10,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datatype {
    pub version: u8,
    pub class: DatatypeClass,
    /// The raw 24-bit class bit field; the decoded meaning lives in
    /// `properties`.
    pub bit_field: u32,
    /// Bytes per element.
    pub size: u32,
    pub properties: DatatypeProperties,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatatypeProperties {
    /// Bit field: bit 0 byte order, bit 1 lo pad, bit 2 hi pad, bit 3
    /// signed. Properties: bit offset (2 bytes), bit precision (2 bytes).
    FixedPoint(FixedPointSpec),
    /// Bit field: bit 0 byte order, bits 1-3 padding, bits 4-5 mantissa
    /// normalization, bits 8-15 sign location. Properties: bit offset,
    /// bit precision, exponent location/size, mantissa location/size,
    /// exponent bias.
    FloatingPoint(FloatSpec),
    /// Bit field: bit 0 byte order. Properties: bit precision (2 bytes).
    /// Values are POSIX epoch seconds.
    Time { big_endian: bool, bit_precision: u16 },
    /// Bit field: bits 0-3 padding type, bits 4-7 character set. The
    /// element size is the fixed string length in bytes.
    String {
        padding: StringPadding,
        charset: CharacterSet,
    },
    /// Bit field: bit 0 byte order, bit 1 lo pad, bit 2 hi pad.
    /// Properties: bit offset, bit precision.
    BitField(FixedPointSpec),
    /// Bit field: bits 0-7 length of the ASCII tag, which is stored
    /// NUL-padded to a multiple of 8 bytes.
    Opaque { tag: String },
    /// Bit field: bits 0-15 number of members. Member descriptors follow,
    /// see [`CompoundMember`].
    Compound { members: Vec<CompoundMember> },
    /// Bit field: bits 0-3 reference kind.
    Reference(ReferenceKind),
    /// Bit field: bits 0-15 number of enumerators. Properties: the base
    /// datatype, then all names (NUL-padded to 8 bytes), then all values
    /// (base-size bytes each).
    Enum {
        base: Box<Datatype>,
        names: Vec<String>,
        /// Raw value words, `base.size` bytes each, index-aligned with
        /// `names`.
        values: Vec<Vec<u8>>,
    },
    /// Bit field: bits 0-3 type (1 = string), bits 4-7 padding, bits 8-11
    /// character set. The element size is always offset-size + 4: the
    /// global heap collection address plus a 4-byte object index; the
    /// byte length of the value is the heap object's own size.
    VariableLength {
        base: Box<Datatype>,
        is_string: bool,
        padding: StringPadding,
        charset: CharacterSet,
    },
    /// Properties: rank (1 byte), 3 reserved bytes, one 4-byte size per
    /// dimension, then the base datatype.
    Array {
        base: Box<Datatype>,
        dimensions: Vec<u32>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatSpec {
    pub big_endian: bool,
    pub bit_offset: u16,
    pub bit_precision: u16,
    pub exponent_location: u8,
    pub exponent_size: u8,
    pub mantissa_location: u8,
    pub mantissa_size: u8,
    pub exponent_bias: u32,
    pub sign_location: u8,
}

impl FloatSpec {
    /// IEEE 754 binary32 with the standard field placement.
    pub fn is_ieee_single(&self, size: u32) -> bool {
        size == 4
            && self.bit_offset == 0
            && self.bit_precision == 32
            && self.exponent_location == 23
            && self.exponent_size == 8
            && self.mantissa_location == 0
            && self.mantissa_size == 23
            && self.exponent_bias == 127
    }

    /// IEEE 754 binary64 with the standard field placement.
    pub fn is_ieee_double(&self, size: u32) -> bool {
        size == 8
            && self.bit_offset == 0
            && self.bit_precision == 64
            && self.exponent_location == 52
            && self.exponent_size == 11
            && self.mantissa_location == 0
            && self.mantissa_size == 52
            && self.exponent_bias == 1023
    }
}

/// One member of a compound datatype. Version 1 descriptor:
///
/// | Size | Field |
/// | ---- | ----- |
/// | -    | Name, NUL-terminated, padded to a multiple of 8 bytes |
/// | 4    | Byte offset of the member within the compound |
/// | 1    | Dimensionality (0-4) |
/// | 3    | Reserved |
/// | 4    | Dimension permutation |
/// | 4    | Reserved |
/// | 16   | Four 4-byte dimension sizes (unused entries zero) |
/// | -    | Member datatype (recursive) |
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundMember {
    pub name: String,
    pub byte_offset: u32,
    pub dimensions: Vec<u32>,
    pub datatype: Datatype,
}

impl CompoundMember {
    /// Element count of the member including its inline array dimensions.
    pub fn element_count(&self) -> u64 {
        self.dimensions.iter().map(|d| *d as u64).product::<u64>().max(1)
    }

    pub fn byte_size(&self) -> u64 {
        self.element_count() * self.datatype.size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum StringPadding {
    NullTerminate = 0,
    NullPad = 1,
    SpacePad = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CharacterSet {
    Ascii = 0,
    Utf8 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ReferenceKind {
    Object1 = 0,
    DatasetRegion1 = 1,
    Object2 = 2,
    DatasetRegion2 = 3,
    Attribute = 4,
}

impl Datatype {
    pub fn read(block: &mut Block, ctx: &FormatContext) -> Result<Datatype> {
        let class_and_version = block.read_u8()?;
        let version = class_and_version >> 4;
        let class_byte = class_and_version & 0x0f;
        let class = DatatypeClass::try_from(class_byte).map_err(|_| {
            HdfError::UnsupportedDatatype(format!("unknown datatype class {class_byte}"))
        })?;

        let mut field = [0u8; 4];
        block.read_exact(&mut field[..3])?;
        let bit_field = u32::from_le_bytes(field);
        let size = block.read_u32::<LittleEndian>()?;

        trace!("datatype class {class:?} v{version}, size {size}");

        let properties = match class {
            DatatypeClass::FixedPoint => Self::read_fixed_point(block, bit_field, size)?,
            DatatypeClass::FloatingPoint => Self::read_float(block, bit_field)?,
            DatatypeClass::Time => DatatypeProperties::Time {
                big_endian: bit_field & 0x01 != 0,
                bit_precision: block.read_u16::<LittleEndian>()?,
            },
            DatatypeClass::String => DatatypeProperties::String {
                padding: string_padding(bit_field & 0x0f)?,
                charset: character_set((bit_field >> 4) & 0x0f)?,
            },
            DatatypeClass::BitField => Self::read_bit_field(block, bit_field, size)?,
            DatatypeClass::Opaque => {
                let tag_len = (bit_field & 0xff) as usize;
                let padded = tag_len.div_ceil(8) * 8;
                let bytes = block.read_bytes(padded)?;
                let tag = String::from_utf8_lossy(&bytes[..tag_len])
                    .trim_end_matches('\0')
                    .to_string();
                DatatypeProperties::Opaque { tag }
            }
            DatatypeClass::Compound => Self::read_compound(block, ctx, version, bit_field, size)?,
            DatatypeClass::Reference => {
                let kind_bits = (bit_field & 0x0f) as u8;
                let kind = ReferenceKind::try_from(kind_bits).map_err(|_| {
                    HdfError::UnsupportedDatatype(format!("unknown reference kind {kind_bits}"))
                })?;
                DatatypeProperties::Reference(kind)
            }
            DatatypeClass::Enum => Self::read_enum(block, ctx, bit_field)?,
            DatatypeClass::VariableLength => Self::read_vlen(block, ctx, bit_field, size)?,
            DatatypeClass::Array => Self::read_array(block, ctx, version)?,
        };

        Ok(Datatype {
            version,
            class,
            bit_field,
            size,
            properties,
        })
    }

    fn read_fixed_point(block: &mut Block, bit_field: u32, size: u32) -> Result<DatatypeProperties> {
        let bit_offset = block.read_u16::<LittleEndian>()?;
        let bit_precision = block.read_u16::<LittleEndian>()?;
        let spec = FixedPointSpec {
            size: word_size(size)?,
            big_endian: bit_field & 0x01 != 0,
            lo_pad: bit_field & 0x02 != 0,
            hi_pad: bit_field & 0x04 != 0,
            signed: bit_field & 0x08 != 0,
            bit_offset,
            bit_precision,
        };
        spec.validate()?;
        Ok(DatatypeProperties::FixedPoint(spec))
    }

    fn read_bit_field(block: &mut Block, bit_field: u32, size: u32) -> Result<DatatypeProperties> {
        let bit_offset = block.read_u16::<LittleEndian>()?;
        let bit_precision = block.read_u16::<LittleEndian>()?;
        let spec = FixedPointSpec {
            size: word_size(size)?,
            big_endian: bit_field & 0x01 != 0,
            lo_pad: bit_field & 0x02 != 0,
            hi_pad: bit_field & 0x04 != 0,
            signed: false,
            bit_offset,
            bit_precision,
        };
        spec.validate()?;
        Ok(DatatypeProperties::BitField(spec))
    }

    fn read_float(block: &mut Block, bit_field: u32) -> Result<DatatypeProperties> {
        Ok(DatatypeProperties::FloatingPoint(FloatSpec {
            big_endian: bit_field & 0x01 != 0,
            sign_location: ((bit_field >> 8) & 0xff) as u8,
            bit_offset: block.read_u16::<LittleEndian>()?,
            bit_precision: block.read_u16::<LittleEndian>()?,
            exponent_location: block.read_u8()?,
            exponent_size: block.read_u8()?,
            mantissa_location: block.read_u8()?,
            mantissa_size: block.read_u8()?,
            exponent_bias: block.read_u32::<LittleEndian>()?,
        }))
    }

    fn read_compound(
        block: &mut Block,
        ctx: &FormatContext,
        version: u8,
        bit_field: u32,
        size: u32,
    ) -> Result<DatatypeProperties> {
        let member_count = (bit_field & 0xffff) as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            let member = match version {
                1 => {
                    let name = block.read_padded_name()?;
                    let byte_offset = block.read_u32::<LittleEndian>()?;
                    let dimensionality = block.read_u8()? as usize;
                    block.skip_bytes(3)?;
                    block.skip_bytes(4)?; // dimension permutation
                    block.skip_bytes(4)?;
                    let mut dims = [0u32; 4];
                    for dim in dims.iter_mut() {
                        *dim = block.read_u32::<LittleEndian>()?;
                    }
                    if dimensionality > 4 {
                        return Err(HdfError::CorruptFile(format!(
                            "compound member dimensionality {dimensionality} exceeds 4"
                        )));
                    }
                    let datatype = Datatype::read(block, ctx)?;
                    CompoundMember {
                        name,
                        byte_offset,
                        dimensions: dims[..dimensionality].to_vec(),
                        datatype,
                    }
                }
                2 => {
                    let name = block.read_padded_name()?;
                    let byte_offset = block.read_u32::<LittleEndian>()?;
                    let datatype = Datatype::read(block, ctx)?;
                    CompoundMember {
                        name,
                        byte_offset,
                        dimensions: Vec::new(),
                        datatype,
                    }
                }
                _ => {
                    return Err(HdfError::UnsupportedVersion {
                        entity: "compound datatype",
                        version,
                    })
                }
            };
            if member.byte_offset as u64 + member.byte_size() > size as u64 {
                return Err(HdfError::CorruptFile(format!(
                    "compound member '{}' overruns element size {size}",
                    member.name
                )));
            }
            members.push(member);
        }
        Ok(DatatypeProperties::Compound { members })
    }

    fn read_enum(block: &mut Block, ctx: &FormatContext, bit_field: u32) -> Result<DatatypeProperties> {
        let base = Datatype::read(block, ctx)?;
        let count = (bit_field & 0xffff) as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(block.read_padded_name()?);
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(block.read_bytes(base.size as usize)?);
        }
        Ok(DatatypeProperties::Enum {
            base: Box::new(base),
            names,
            values,
        })
    }

    fn read_vlen(
        block: &mut Block,
        ctx: &FormatContext,
        bit_field: u32,
        size: u32,
    ) -> Result<DatatypeProperties> {
        let is_string = bit_field & 0x0f == 1;
        let padding = string_padding((bit_field >> 4) & 0x0f)?;
        let charset = character_set((bit_field >> 8) & 0x0f)?;
        let expected = ctx.offset_size as u32 + 4;
        if size != expected {
            return Err(HdfError::CorruptFile(format!(
                "variable-length element size is {size}, expected {expected}"
            )));
        }
        let base = Datatype::read(block, ctx)?;
        Ok(DatatypeProperties::VariableLength {
            base: Box::new(base),
            is_string,
            padding,
            charset,
        })
    }

    fn read_array(block: &mut Block, ctx: &FormatContext, version: u8) -> Result<DatatypeProperties> {
        if !matches!(version, 2 | 3) {
            return Err(HdfError::UnsupportedVersion {
                entity: "array datatype",
                version,
            });
        }
        let rank = block.read_u8()? as usize;
        if version == 2 {
            block.skip_bytes(3)?;
        }
        let mut dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            dimensions.push(block.read_u32::<LittleEndian>()?);
        }
        let base = Datatype::read(block, ctx)?;
        Ok(DatatypeProperties::Array {
            base: Box::new(base),
            dimensions,
        })
    }

    /// The fixed-point window description for FIXED and BITFIELD classes.
    pub fn fixed_point_spec(&self) -> Option<&FixedPointSpec> {
        match &self.properties {
            DatatypeProperties::FixedPoint(spec) | DatatypeProperties::BitField(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&[CompoundMember]> {
        match &self.properties {
            DatatypeProperties::Compound { members } => Some(members),
            _ => None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&CompoundMember> {
        self.members()?.iter().find(|m| m.name == name)
    }

    /// Resolves a raw enum word to its enumerator name.
    pub fn enum_name(&self, raw: &[u8]) -> Option<&str> {
        match &self.properties {
            DatatypeProperties::Enum { names, values, .. } => values
                .iter()
                .position(|v| v == raw)
                .map(|i| names[i].as_str()),
            _ => None,
        }
    }

    pub fn is_variable_length_string(&self) -> bool {
        matches!(
            &self.properties,
            DatatypeProperties::VariableLength { is_string: true, .. }
        )
    }
}

fn word_size(size: u32) -> Result<u8> {
    if (1..=8).contains(&size) {
        Ok(size as u8)
    } else {
        Err(HdfError::UnsupportedDatatype(format!(
            "fixed-point element size {size} outside 1..=8 bytes"
        )))
    }
}

fn string_padding(bits: u32) -> Result<StringPadding> {
    StringPadding::try_from(bits as u8)
        .map_err(|_| HdfError::UnsupportedDatatype(format!("unknown string padding {bits}")))
}

fn character_set(bits: u32) -> Result<CharacterSet> {
    CharacterSet::try_from(bits as u8)
        .map_err(|_| HdfError::UnsupportedDatatype(format!("unknown character set {bits}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::write::encode;

    const CTX: FormatContext = FormatContext {
        offset_size: 8,
        length_size: 8,
    };

    #[test]
    fn fixed_point_i32() {
        let image = encode::fixed_point(4, true, 0, 32);
        let dt = Datatype::read(&mut Cursor::new(image), &CTX).unwrap();
        assert_eq!(dt.class, DatatypeClass::FixedPoint);
        assert_eq!(dt.size, 4);
        let spec = dt.fixed_point_spec().unwrap();
        assert!(spec.signed);
        assert!(!spec.big_endian);
        assert_eq!(spec.bit_precision, 32);
    }

    #[test]
    fn ieee_double() {
        let image = encode::float_f64();
        let dt = Datatype::read(&mut Cursor::new(image), &CTX).unwrap();
        match &dt.properties {
            DatatypeProperties::FloatingPoint(spec) => assert!(spec.is_ieee_double(dt.size)),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn compound_with_nested_members() {
        let image = encode::compound(
            24,
            &[
                ("id", 0, encode::fixed_point(8, false, 0, 64)),
                ("value", 8, encode::float_f64()),
                ("flags", 16, encode::fixed_point(4, false, 0, 32)),
            ],
        );
        let dt = Datatype::read(&mut Cursor::new(image), &CTX).unwrap();
        let members = dt.members().unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[1].name, "value");
        assert_eq!(members[1].byte_offset, 8);
        assert_eq!(dt.member("flags").unwrap().datatype.size, 4);
    }

    #[test]
    fn compound_member_overrun_is_corrupt() {
        let image = encode::compound(8, &[("id", 4, encode::fixed_point(8, false, 0, 64))]);
        assert!(matches!(
            Datatype::read(&mut Cursor::new(image), &CTX),
            Err(HdfError::CorruptFile(_))
        ));
    }

    #[test]
    fn vlen_string_element_size() {
        let image = encode::vlen_string(&CTX);
        let dt = Datatype::read(&mut Cursor::new(image), &CTX).unwrap();
        assert!(dt.is_variable_length_string());
        assert_eq!(dt.size, 12);
    }

    #[test]
    fn enum_names() {
        let image = encode::enumeration(
            encode::fixed_point(4, true, 0, 32),
            4,
            &[("OFF", &0i32.to_le_bytes()), ("ON", &1i32.to_le_bytes())],
        );
        let dt = Datatype::read(&mut Cursor::new(image), &CTX).unwrap();
        assert_eq!(dt.enum_name(&1i32.to_le_bytes()), Some("ON"));
        assert_eq!(dt.enum_name(&7i32.to_le_bytes()), None);
    }

    #[test]
    fn remaining_classes() {
        let dt = Datatype::read(&mut Cursor::new(encode::time(4, 32)), &CTX).unwrap();
        assert!(matches!(
            dt.properties,
            DatatypeProperties::Time { bit_precision: 32, .. }
        ));

        let dt = Datatype::read(&mut Cursor::new(encode::bit_field(2, 3, 9)), &CTX).unwrap();
        let spec = dt.fixed_point_spec().unwrap();
        assert_eq!((spec.bit_offset, spec.bit_precision, spec.signed), (3, 9, false));

        let dt = Datatype::read(&mut Cursor::new(encode::opaque(16, "frame")), &CTX).unwrap();
        assert_eq!(
            dt.properties,
            DatatypeProperties::Opaque { tag: "frame".into() }
        );

        let dt = Datatype::read(&mut Cursor::new(encode::reference(8, 1)), &CTX).unwrap();
        assert_eq!(
            dt.properties,
            DatatypeProperties::Reference(ReferenceKind::DatasetRegion1)
        );

        let dt = Datatype::read(
            &mut Cursor::new(encode::array(&[2, 3], 4, encode::fixed_point(4, true, 0, 32))),
            &CTX,
        )
        .unwrap();
        match &dt.properties {
            DatatypeProperties::Array { dimensions, base } => {
                assert_eq!(dimensions, &[2, 3]);
                assert_eq!(base.class, DatatypeClass::FixedPoint);
                assert_eq!(dt.size, 24);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn unknown_class_is_unsupported() {
        let image = vec![0x0f, 0, 0, 0, 4, 0, 0, 0];
        assert!(matches!(
            Datatype::read(&mut Cursor::new(image), &CTX),
            Err(HdfError::UnsupportedDatatype(_))
        ));
    }
}
