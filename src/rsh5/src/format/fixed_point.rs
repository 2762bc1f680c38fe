use paste::paste;

use super::*;

/// Bit-level description of a fixed-point (integer) value.
///
/// The same description serves two roles: file addresses and lengths (size =
/// the superblock's size-of-offsets / size-of-lengths, full precision,
/// little-endian, unsigned) and application integer fields inside datasets,
/// where any sub-word `[bit_offset, bit_offset + bit_precision)` window with
/// lo/hi padding is legal.
///
/// Invariant: `bit_offset + bit_precision <= 8 * size` and `size` is 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPointSpec {
    /// Byte size of the stored word, 1..=8.
    pub size: u8,
    pub big_endian: bool,
    pub signed: bool,
    /// Fill bit for positions below `bit_offset` when re-encoding.
    pub lo_pad: bool,
    /// Fill bit for positions at and above `bit_offset + bit_precision`.
    pub hi_pad: bool,
    pub bit_offset: u16,
    pub bit_precision: u16,
}

impl FixedPointSpec {
    /// Spec for a file address or length of `size` bytes: unsigned,
    /// little-endian, full precision. Reused for every offset/length read
    /// once the superblock has been decoded.
    pub fn address(size: u8) -> FixedPointSpec {
        FixedPointSpec {
            size,
            big_endian: false,
            signed: false,
            lo_pad: false,
            hi_pad: false,
            bit_offset: 0,
            bit_precision: size as u16 * 8,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bits = self.size as u32 * 8;
        if self.size == 0 || self.size > 8 {
            return Err(HdfError::UnsupportedDatatype(format!(
                "fixed-point size {} out of range 1..=8",
                self.size
            )));
        }
        if self.bit_precision == 0
            || self.bit_offset as u32 + self.bit_precision as u32 > bits
        {
            return Err(HdfError::UnsupportedDatatype(format!(
                "fixed-point window [{}, {}) exceeds {} bits",
                self.bit_offset,
                self.bit_offset as u32 + self.bit_precision as u32,
                bits
            )));
        }
        Ok(())
    }

    pub fn is_full_width(&self) -> bool {
        self.bit_offset == 0 && self.bit_precision as u32 == self.size as u32 * 8
    }
}

/// One stored fixed-point word: the raw bytes plus their interpretation.
///
/// A value whose every byte is `0xff` is *undefined*; undefined addresses
/// mean "no such object". Only the raw getters succeed on an undefined
/// value; every numeric conversion reports [`HdfError::Undefined`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPointValue {
    bytes: Vec<u8>,
    spec: FixedPointSpec,
}

impl FixedPointValue {
    pub fn new(bytes: Vec<u8>, spec: FixedPointSpec) -> Result<FixedPointValue> {
        spec.validate()?;
        if bytes.len() != spec.size as usize {
            return Err(HdfError::CorruptFile(format!(
                "fixed-point buffer is {} bytes, spec wants {}",
                bytes.len(),
                spec.size
            )));
        }
        Ok(FixedPointValue { bytes, spec })
    }

    pub fn spec(&self) -> &FixedPointSpec {
        &self.spec
    }

    pub fn is_undefined(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0xff)
    }

    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    /// The stored word with no window extraction applied, zero-extended.
    /// This is the getter for "packed" members whose sub-word layout is an
    /// application-level contract.
    pub fn raw_word(&self) -> u64 {
        self.word() as u64
    }

    // Assemble the byte buffer into a native word, honoring endianness.
    fn word(&self) -> u128 {
        let mut w: u128 = 0;
        if self.spec.big_endian {
            for b in &self.bytes {
                w = (w << 8) | *b as u128;
            }
        } else {
            for b in self.bytes.iter().rev() {
                w = (w << 8) | *b as u128;
            }
        }
        w
    }

    /// Extract the `[bit_offset, bit_offset + bit_precision)` window as a
    /// signed integer: right-shift by the offset, mask to the precision,
    /// then sign-extend from the precision's top bit when the spec is
    /// signed.
    pub fn to_i128(&self) -> Result<i128> {
        if self.is_undefined() {
            return Err(HdfError::Undefined);
        }
        let p = self.spec.bit_precision as u32;
        let mask = if p == 128 { u128::MAX } else { (1u128 << p) - 1 };
        let extracted = (self.word() >> self.spec.bit_offset) & mask;
        if self.spec.signed && extracted >> (p - 1) & 1 == 1 {
            Ok(extracted as i128 - (1i128 << p))
        } else {
            Ok(extracted as i128)
        }
    }

    pub fn to_u128(&self) -> Result<u128> {
        let v = self.to_i128()?;
        u128::try_from(v).map_err(|_| HdfError::ValueOutOfRange {
            target: "u128",
            value: v.to_string(),
        })
    }

    /// Re-encode the extracted value into `size` bytes. Bits inside the
    /// precision window round-trip exactly; bits outside it are filled from
    /// the lo/hi pad flags, so they may differ from the bytes read.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.is_undefined() {
            return Ok(self.bytes.clone());
        }
        let spec = &self.spec;
        let bits = spec.size as u32 * 8;
        let p = spec.bit_precision as u32;
        let o = spec.bit_offset as u32;
        let mask = if p == 128 { u128::MAX } else { (1u128 << p) - 1 };

        let mut word = ((self.word() >> o) & mask) << o;
        if spec.lo_pad && o > 0 {
            word |= (1u128 << o) - 1;
        }
        if spec.hi_pad && o + p < bits {
            let hi = ((1u128 << (bits - o - p)) - 1) << (o + p);
            word |= hi;
        }

        let mut out = vec![0u8; spec.size as usize];
        for (i, byte) in out.iter_mut().enumerate() {
            let shift = if spec.big_endian {
                (spec.size as usize - 1 - i) * 8
            } else {
                i * 8
            };
            *byte = (word >> shift) as u8;
        }
        Ok(out)
    }

    /// Decimal string of `value / 10^scale` with exactly `scale` fractional
    /// digits.
    pub fn to_decimal_string(&self, scale: u32) -> Result<String> {
        let v = self.to_i128()?;
        if scale == 0 {
            return Ok(v.to_string());
        }
        let divisor = 10i128.pow(scale);
        let sign = if v < 0 { "-" } else { "" };
        let abs = v.unsigned_abs();
        let int = abs / divisor as u128;
        let frac = abs % divisor as u128;
        Ok(format!("{sign}{int}.{frac:0width$}", width = scale as usize))
    }

    fn convert_signed(&self, target: &'static str, bits: u32) -> Result<i128> {
        let v = self.to_i128()?;
        if self.spec.bit_precision as u32 > bits {
            return Err(HdfError::ValueOutOfRange {
                target,
                value: v.to_string(),
            });
        }
        let min = -(1i128 << (bits - 1));
        let max = (1i128 << (bits - 1)) - 1;
        if v < min || v > max {
            return Err(HdfError::ValueOutOfRange {
                target,
                value: v.to_string(),
            });
        }
        Ok(v)
    }

    fn convert_unsigned(&self, target: &'static str, bits: u32) -> Result<u128> {
        let v = self.to_i128()?;
        if v < 0 || self.spec.bit_precision as u32 > bits {
            return Err(HdfError::ValueOutOfRange {
                target,
                value: v.to_string(),
            });
        }
        let max = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
        let u = v as u128;
        if u > max {
            return Err(HdfError::ValueOutOfRange {
                target,
                value: v.to_string(),
            });
        }
        Ok(u)
    }
}

macro_rules! fixed_to_signed {
    ($($ty:ty)*) => {
        paste! {
            impl FixedPointValue {
                $(
                    #[doc = concat!("Convert to `", stringify!($ty), "`, rejecting values and precisions that do not fit.")]
                    pub fn [<to_ $ty>](&self) -> Result<$ty> {
                        Ok(self.convert_signed(stringify!($ty), <$ty>::BITS)? as $ty)
                    }
                )*
            }
        }
    };
}

macro_rules! fixed_to_unsigned {
    ($($ty:ty)*) => {
        paste! {
            impl FixedPointValue {
                $(
                    #[doc = concat!("Convert to `", stringify!($ty), "`, rejecting values and precisions that do not fit.")]
                    pub fn [<to_ $ty>](&self) -> Result<$ty> {
                        Ok(self.convert_unsigned(stringify!($ty), <$ty>::BITS)? as $ty)
                    }
                )*
            }
        }
    };
}

fixed_to_signed!(i8 i16 i32 i64);
fixed_to_unsigned!(u8 u16 u32 u64);

impl std::fmt::Display for FixedPointValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_i128() {
            Ok(v) => write!(f, "{v}"),
            Err(_) => f.write_str("undefined"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(size: u8, signed: bool, offset: u16, precision: u16) -> FixedPointSpec {
        FixedPointSpec {
            size,
            big_endian: false,
            signed,
            lo_pad: false,
            hi_pad: false,
            bit_offset: offset,
            bit_precision: precision,
        }
    }

    #[test]
    fn full_width_le() {
        let v = FixedPointValue::new(vec![0x2a, 0, 0, 0], spec(4, true, 0, 32)).unwrap();
        assert_eq!(v.to_i32().unwrap(), 42);
        assert_eq!(v.to_string(), "42");
    }

    #[test]
    fn full_width_be() {
        let mut s = spec(4, true, 0, 32);
        s.big_endian = true;
        let v = FixedPointValue::new(vec![0, 0, 0, 0x2a], s).unwrap();
        assert_eq!(v.to_i32().unwrap(), 42);
    }

    #[test]
    fn negative_two_complement() {
        let v = FixedPointValue::new(vec![0xfe, 0xff], spec(2, true, 0, 16)).unwrap();
        assert_eq!(v.to_i16().unwrap(), -2);
        assert_eq!(v.to_i64().unwrap(), -2);
        assert!(matches!(
            v.to_u16(),
            Err(HdfError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn window_extraction() {
        // word 0x0000_0000_0000_00b0 = 0b1011_0000, offset 4, precision 3 -> 0b011
        let v = FixedPointValue::new(vec![0xb0, 0, 0, 0, 0, 0, 0, 0], spec(8, false, 4, 3)).unwrap();
        assert_eq!(v.to_u8().unwrap(), 3);
        assert_eq!(v.raw_word(), 0xb0);
    }

    #[test]
    fn window_sign_extension() {
        // offset 2, precision 3, stored bits 0b111_00 -> extracted 0b111 -> -1
        let v = FixedPointValue::new(vec![0b0001_1100], spec(1, true, 2, 3)).unwrap();
        assert_eq!(v.to_i8().unwrap(), -1);
    }

    #[test]
    fn precision_rejects_narrow_target() {
        // value 42 fits a u8, but the 32-bit precision does not
        let v = FixedPointValue::new(vec![0x2a, 0, 0, 0], spec(4, false, 0, 32)).unwrap();
        assert!(matches!(v.to_u8(), Err(HdfError::ValueOutOfRange { .. })));
        assert_eq!(v.to_u32().unwrap(), 42);
    }

    #[test]
    fn undefined_sentinel() {
        let v = FixedPointValue::new(vec![0xff; 8], FixedPointSpec::address(8)).unwrap();
        assert!(v.is_undefined());
        assert!(matches!(v.to_u64(), Err(HdfError::Undefined)));
        assert_eq!(v.raw(), &[0xff; 8]);
        assert_eq!(v.to_string(), "undefined");
    }

    #[test]
    fn roundtrip_preserves_window_bits() {
        let mut s = spec(2, false, 3, 7);
        s.lo_pad = true;
        s.hi_pad = false;
        let v = FixedPointValue::new(vec![0b1010_1000, 0b0000_0001], s).unwrap();
        let bytes = v.to_bytes().unwrap();
        let back = FixedPointValue::new(bytes, s).unwrap();
        assert_eq!(v.to_u16().unwrap(), back.to_u16().unwrap());
        // lo pad filled bits [0, 3)
        assert_eq!(back.raw()[0] & 0b0000_0111, 0b0000_0111);
    }

    #[test]
    fn decimal_scaling() {
        let v = FixedPointValue::new(vec![0x39, 0x30, 0, 0], spec(4, true, 0, 32)).unwrap();
        // 12345 / 10^2
        assert_eq!(v.to_decimal_string(2).unwrap(), "123.45");
        let neg = FixedPointValue::new(vec![0xc7, 0xcf, 0xff, 0xff], spec(4, true, 0, 32)).unwrap();
        // -12345 / 10^3
        assert_eq!(neg.to_decimal_string(3).unwrap(), "-12.345");
    }
}
