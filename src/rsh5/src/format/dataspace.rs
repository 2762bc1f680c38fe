use super::*;

/// # IV.A.2.b The Dataspace Message
///
/// The shape of a dataset or attribute: a rank and per-dimension current /
/// maximum sizes. A rank of zero is a scalar.
///
/// | Size        | Field |
/// | ----------- | ----- |
/// | 1           | Version (1 or 2) |
/// | 1           | Dimensionality (rank) |
/// | 1           | Flags (bit 0: maximum sizes present) |
/// | 5 / 1       | Reserved (version 1) / Type (version 2: 0 scalar, 1 simple, 2 null) |
/// | length-size | Dimension sizes, one per rank |
/// | length-size | Maximum sizes, one per rank, if flag bit 0 |
///
/// A maximum size of all-0xff means the dimension is unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    pub version: u8,
    pub dimensions: Vec<u64>,
    /// `None` marks an unlimited dimension.
    pub max_dimensions: Vec<Option<u64>>,
    /// Version 2 "null" dataspaces contain no elements at all.
    pub is_null: bool,
}

impl Dataspace {
    pub const FLAG_MAX_DIMS: u8 = 0x01;

    pub fn scalar() -> Dataspace {
        Dataspace {
            version: 1,
            dimensions: Vec::new(),
            max_dimensions: Vec::new(),
            is_null: false,
        }
    }

    pub fn simple(dimensions: Vec<u64>) -> Dataspace {
        let max_dimensions = dimensions.iter().map(|d| Some(*d)).collect();
        Dataspace {
            version: 1,
            dimensions,
            max_dimensions,
            is_null: false,
        }
    }

    pub fn read(block: &mut Block, ctx: &FormatContext) -> Result<Dataspace> {
        let version = block.read_u8()?;
        let rank = block.read_u8()? as usize;
        let flags = block.read_u8()?;
        let mut is_null = false;
        match version {
            1 => block.skip_bytes(5)?,
            2 => is_null = block.read_u8()? == 2,
            _ => {
                return Err(HdfError::UnsupportedVersion {
                    entity: "dataspace message",
                    version,
                })
            }
        }

        let mut dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            dimensions.push(block.read_sized(ctx.length_size)?);
        }

        let mut max_dimensions = Vec::with_capacity(rank);
        if flags & Self::FLAG_MAX_DIMS != 0 {
            for dim in &dimensions {
                let bytes = block.read_bytes(ctx.length_size as usize)?;
                let value = FixedPointValue::new(bytes, ctx.length_spec())?;
                let max = if value.is_undefined() {
                    None
                } else {
                    Some(value.to_u64()?)
                };
                if let Some(max) = max {
                    if *dim > max {
                        return Err(HdfError::CorruptFile(format!(
                            "dimension size {dim} exceeds maximum {max}"
                        )));
                    }
                }
                max_dimensions.push(max);
            }
        } else {
            max_dimensions.extend(dimensions.iter().map(|d| Some(*d)));
        }

        Ok(Dataspace {
            version,
            dimensions,
            max_dimensions,
            is_null,
        })
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_scalar(&self) -> bool {
        !self.is_null && self.dimensions.is_empty()
    }

    /// Total number of elements: the product of the dimension sizes, 1 for
    /// a scalar, 0 for a null dataspace.
    pub fn element_count(&self) -> u64 {
        if self.is_null {
            return 0;
        }
        self.dimensions.iter().product()
    }
}

/// A subset of a dataspace, as carried by region references and virtual
/// layout descriptors.
///
/// Serialized as selection type (4 bytes), version (4 bytes), then
/// type-specific payload; coordinates and hyperslab fields are 8-byte
/// little-endian values.
///
/// | Type | Payload |
/// | ---- | ------- |
/// | 0 none | - |
/// | 1 points | rank (4), count (4), count x rank coordinates |
/// | 2 hyperslab | rank (4), per dimension start/stride/count/block |
/// | 3 all | - |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    None,
    Points { rank: u32, points: Vec<Vec<u64>> },
    Hyperslab { rank: u32, dims: Vec<HyperslabDim> },
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperslabDim {
    pub start: u64,
    pub stride: u64,
    pub count: u64,
    pub block: u64,
}

impl Selection {
    pub fn read(block: &mut Block) -> Result<Selection> {
        let kind = block.read_u32::<LittleEndian>()?;
        let version = block.read_u32::<LittleEndian>()?;
        if version != 1 {
            return Err(HdfError::UnsupportedVersion {
                entity: "dataspace selection",
                version: version as u8,
            });
        }
        match kind {
            0 => Ok(Selection::None),
            1 => {
                let rank = block.read_u32::<LittleEndian>()?;
                let count = block.read_u32::<LittleEndian>()?;
                let mut points = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let mut point = Vec::with_capacity(rank as usize);
                    for _ in 0..rank {
                        point.push(block.read_u64::<LittleEndian>()?);
                    }
                    points.push(point);
                }
                Ok(Selection::Points { rank, points })
            }
            2 => {
                let rank = block.read_u32::<LittleEndian>()?;
                let mut dims = Vec::with_capacity(rank as usize);
                for _ in 0..rank {
                    dims.push(HyperslabDim {
                        start: block.read_u64::<LittleEndian>()?,
                        stride: block.read_u64::<LittleEndian>()?,
                        count: block.read_u64::<LittleEndian>()?,
                        block: block.read_u64::<LittleEndian>()?,
                    });
                }
                Ok(Selection::Hyperslab { rank, dims })
            }
            3 => Ok(Selection::All),
            _ => Err(HdfError::CorruptFile(format!(
                "unknown selection type {kind}"
            ))),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Selection::None => {
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&1u32.to_le_bytes());
            }
            Selection::Points { rank, points } => {
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&rank.to_le_bytes());
                out.extend_from_slice(&(points.len() as u32).to_le_bytes());
                for point in points {
                    for coord in point {
                        out.extend_from_slice(&coord.to_le_bytes());
                    }
                }
            }
            Selection::Hyperslab { rank, dims } => {
                out.extend_from_slice(&2u32.to_le_bytes());
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&rank.to_le_bytes());
                for dim in dims {
                    out.extend_from_slice(&dim.start.to_le_bytes());
                    out.extend_from_slice(&dim.stride.to_le_bytes());
                    out.extend_from_slice(&dim.count.to_le_bytes());
                    out.extend_from_slice(&dim.block.to_le_bytes());
                }
            }
            Selection::All => {
                out.extend_from_slice(&3u32.to_le_bytes());
                out.extend_from_slice(&1u32.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CTX: FormatContext = FormatContext {
        offset_size: 8,
        length_size: 8,
    };

    #[test]
    fn scalar_space() {
        let mut block = Cursor::new(vec![1, 0, 0, 0, 0, 0, 0, 0]);
        let space = Dataspace::read(&mut block, &CTX).unwrap();
        assert!(space.is_scalar());
        assert_eq!(space.element_count(), 1);
    }

    #[test]
    fn simple_space_with_unlimited_max() {
        let mut image = vec![1, 2, 1, 0, 0, 0, 0, 0];
        image.extend_from_slice(&4u64.to_le_bytes());
        image.extend_from_slice(&17u64.to_le_bytes());
        image.extend_from_slice(&[0xff; 8]); // unlimited
        image.extend_from_slice(&17u64.to_le_bytes());
        let space = Dataspace::read(&mut Cursor::new(image), &CTX).unwrap();
        assert_eq!(space.dimensions, vec![4, 17]);
        assert_eq!(space.max_dimensions, vec![None, Some(17)]);
        assert_eq!(space.element_count(), 68);
    }

    #[test]
    fn current_beyond_max_is_corrupt() {
        let mut image = vec![1, 1, 1, 0, 0, 0, 0, 0];
        image.extend_from_slice(&10u64.to_le_bytes());
        image.extend_from_slice(&4u64.to_le_bytes());
        assert!(matches!(
            Dataspace::read(&mut Cursor::new(image), &CTX),
            Err(HdfError::CorruptFile(_))
        ));
    }

    #[test]
    fn selection_roundtrip() {
        let selection = Selection::Hyperslab {
            rank: 2,
            dims: vec![
                HyperslabDim { start: 0, stride: 1, count: 4, block: 1 },
                HyperslabDim { start: 2, stride: 3, count: 5, block: 2 },
            ],
        };
        let mut bytes = Vec::new();
        selection.write(&mut bytes);
        let back = Selection::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(back, selection);
    }
}
