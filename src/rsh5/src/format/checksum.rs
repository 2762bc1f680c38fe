//! Jenkins lookup3 checksum, as used by version 2 object headers and the
//! version 2 B-tree nodes.

fn rot(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c); *a ^= rot(*c, 4);  *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a); *b ^= rot(*a, 6);  *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b); *c ^= rot(*b, 8);  *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c); *a ^= rot(*c, 16); *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a); *b ^= rot(*a, 19); *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b); *c ^= rot(*b, 4);  *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b; *c = c.wrapping_sub(rot(*b, 14));
    *a ^= *c; *a = a.wrapping_sub(rot(*c, 11));
    *b ^= *a; *b = b.wrapping_sub(rot(*a, 25));
    *c ^= *b; *c = c.wrapping_sub(rot(*b, 16));
    *a ^= *c; *a = a.wrapping_sub(rot(*c, 4));
    *b ^= *a; *b = b.wrapping_sub(rot(*a, 14));
    *c ^= *b; *c = c.wrapping_sub(rot(*b, 24));
}

/// `lookup3` over a little-endian byte stream with an initial value of 0.
pub fn lookup3(data: &[u8]) -> u32 {
    let mut a: u32 = 0xdeadbeefu32.wrapping_add(data.len() as u32);
    let mut b = a;
    let mut c = a;

    let mut chunks = data.chunks_exact(12);
    for chunk in &mut chunks {
        a = a.wrapping_add(u32::from_le_bytes(chunk[0..4].try_into().unwrap()));
        b = b.wrapping_add(u32::from_le_bytes(chunk[4..8].try_into().unwrap()));
        c = c.wrapping_add(u32::from_le_bytes(chunk[8..12].try_into().unwrap()));
        mix(&mut a, &mut b, &mut c);
    }

    let rest = chunks.remainder();
    if rest.is_empty() {
        return c;
    }
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(u32::from_le_bytes(tail[0..4].try_into().unwrap()));
    b = b.wrapping_add(u32::from_le_bytes(tail[4..8].try_into().unwrap()));
    c = c.wrapping_add(u32::from_le_bytes(tail[8..12].try_into().unwrap()));
    final_mix(&mut a, &mut b, &mut c);
    c
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(lookup3(&[]), 0xdeadbeef);
    }

    #[test]
    fn deterministic() {
        let data = b"OHDR\x02\x00";
        assert_eq!(lookup3(data), lookup3(data));
        assert_ne!(lookup3(b"OHDR\x02\x00"), lookup3(b"OHDR\x02\x01"));
    }

    #[test]
    fn multiple_of_twelve() {
        let data = [0x5au8; 24];
        // exercises the exact-chunk path with no remainder
        let full = lookup3(&data);
        assert_ne!(full, lookup3(&data[..23]));
    }
}
