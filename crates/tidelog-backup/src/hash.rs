//! Bob Jenkins' lookup3 `hashlittle`, as pinned by the log file format.
//!
//! Record keys embed one byte of this hash over the version's range-block
//! index, so the exact bit pattern is part of the durable format and cannot
//! be swapped for another hash.

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

fn word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().expect("4 bytes"))
}

/// Hashes `key` into 32 bits, reading words little-endian.
#[must_use]
pub fn hashlittle(key: &[u8], initval: u32) -> u32 {
    let seed = 0xdead_beef_u32.wrapping_add(key.len() as u32).wrapping_add(initval);
    let mut a = seed;
    let mut b = seed;
    let mut c = seed;

    let mut rest = key;
    while rest.len() > 12 {
        a = a.wrapping_add(word(&rest[0..4]));
        b = b.wrapping_add(word(&rest[4..8]));
        c = c.wrapping_add(word(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    if rest.is_empty() {
        return c;
    }
    // Missing tail bytes read as zero, same as the byte-wise tail switch.
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(word(&tail[0..4]));
    b = b.wrapping_add(word(&tail[4..8]));
    c = c.wrapping_add(word(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_the_seed() {
        assert_eq!(hashlittle(&[], 0), 0xdead_beef);
        assert_eq!(hashlittle(&[], 5), 0xdead_beef_u32.wrapping_add(5));
    }

    #[test]
    fn deterministic_and_spread() {
        let a = hashlittle(&1u32.to_le_bytes(), 0);
        let b = hashlittle(&1u32.to_le_bytes(), 0);
        let c = hashlittle(&2u32.to_le_bytes(), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn block_boundaries_mix_fully() {
        // Keys straddling the 12-byte word groups must not collide by
        // construction.
        let mut long = vec![0u8; 25];
        long[24] = 1;
        let mut other = long.clone();
        other[0] = 1;
        other[24] = 0;
        assert_ne!(hashlittle(&long, 0), hashlittle(&other, 0));
    }
}
