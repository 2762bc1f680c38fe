//! Byte emitters for datatype messages, the exact inverse of
//! [`Datatype::read`](crate::format::Datatype::read). The writer composes
//! these into object headers; tests use them to build descriptor images.

use crate::format::{CharacterSet, FormatContext, StringPadding};

/// Name encoding shared by compound members and enumerators:
/// NUL-terminated, padded with NULs to a multiple of 8 bytes.
pub fn padded_name(name: &str) -> Vec<u8> {
    let mut out = name.as_bytes().to_vec();
    out.push(0);
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

fn header(class: u8, version: u8, bit_field: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push((version << 4) | class);
    out.extend_from_slice(&bit_field.to_le_bytes()[..3]);
    out.extend_from_slice(&size.to_le_bytes());
    out
}

/// Class 0, version 1. Little-endian, no padding bits.
pub fn fixed_point(size: u32, signed: bool, bit_offset: u16, bit_precision: u16) -> Vec<u8> {
    let bit_field = if signed { 0x08 } else { 0x00 };
    let mut out = header(0, 1, bit_field, size);
    out.extend_from_slice(&bit_offset.to_le_bytes());
    out.extend_from_slice(&bit_precision.to_le_bytes());
    out
}

/// Class 1, version 1: IEEE 754 binary32, little-endian.
pub fn float_f32() -> Vec<u8> {
    let mut out = header(1, 1, 0x1f00, 4);
    out.extend_from_slice(&0u16.to_le_bytes()); // bit offset
    out.extend_from_slice(&32u16.to_le_bytes()); // bit precision
    out.push(23); // exponent location
    out.push(8); // exponent size
    out.push(0); // mantissa location
    out.push(23); // mantissa size
    out.extend_from_slice(&127u32.to_le_bytes());
    out
}

/// Class 1, version 1: IEEE 754 binary64, little-endian.
pub fn float_f64() -> Vec<u8> {
    let mut out = header(1, 1, 0x3f00, 8);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.push(52);
    out.push(11);
    out.push(0);
    out.push(52);
    out.extend_from_slice(&1023u32.to_le_bytes());
    out
}

/// Class 2, version 1: epoch seconds, little-endian.
pub fn time(size: u32, bit_precision: u16) -> Vec<u8> {
    let mut out = header(2, 1, 0, size);
    out.extend_from_slice(&bit_precision.to_le_bytes());
    out
}

/// Class 3, version 1: fixed-length string of `size` bytes.
pub fn string(size: u32, padding: StringPadding, charset: CharacterSet) -> Vec<u8> {
    let bit_field = (padding as u32) | ((charset as u32) << 4);
    header(3, 1, bit_field, size)
}

/// Class 4, version 1: bit field window.
pub fn bit_field(size: u32, bit_offset: u16, bit_precision: u16) -> Vec<u8> {
    let mut out = header(4, 1, 0, size);
    out.extend_from_slice(&bit_offset.to_le_bytes());
    out.extend_from_slice(&bit_precision.to_le_bytes());
    out
}

/// Class 5, version 1: opaque bytes with an ASCII tag.
pub fn opaque(size: u32, tag: &str) -> Vec<u8> {
    let mut padded = tag.as_bytes().to_vec();
    while padded.len() % 8 != 0 {
        padded.push(0);
    }
    let mut out = header(5, 1, tag.len() as u32, size);
    out.extend_from_slice(&padded);
    out
}

/// Class 6, version 1: members as `(name, byte offset, datatype message)`.
pub fn compound(size: u32, members: &[(&str, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = header(6, 1, members.len() as u32, size);
    for (name, offset, datatype) in members {
        out.extend_from_slice(&padded_name(name));
        out.extend_from_slice(&offset.to_le_bytes());
        out.push(0); // dimensionality
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&0u32.to_le_bytes()); // permutation
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]); // dimension sizes
        out.extend_from_slice(datatype);
    }
    out
}

/// Class 7, version 1: reference of the given kind.
pub fn reference(offset_size: u8, kind: u8) -> Vec<u8> {
    header(7, 1, kind as u32, offset_size as u32)
}

/// Class 8, version 1: enumeration over `base`.
pub fn enumeration(base: Vec<u8>, size: u32, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = header(8, 1, entries.len() as u32, size);
    out.extend_from_slice(&base);
    for (name, _) in entries {
        out.extend_from_slice(&padded_name(name));
    }
    for (_, value) in entries {
        out.extend_from_slice(value);
    }
    out
}

/// Class 9, version 1: variable-length UTF-8 string. The element is the
/// global heap collection address plus a 4-byte object index.
pub fn vlen_string(ctx: &FormatContext) -> Vec<u8> {
    let bit_field = 0x01 | ((StringPadding::NullTerminate as u32) << 4)
        | ((CharacterSet::Utf8 as u32) << 8);
    let mut out = header(9, 1, bit_field, ctx.offset_size as u32 + 4);
    out.extend_from_slice(&fixed_point(1, false, 0, 8));
    out
}

/// Class 10, version 2: array over `base` with the given dimension sizes.
pub fn array(dimensions: &[u32], element_size: u32, base: Vec<u8>) -> Vec<u8> {
    let total: u32 = dimensions.iter().product();
    let mut out = header(10, 2, 0, total * element_size);
    out.push(dimensions.len() as u8);
    out.extend_from_slice(&[0; 3]);
    for dim in dimensions {
        out.extend_from_slice(&dim.to_le_bytes());
    }
    out.extend_from_slice(&base);
    out
}
