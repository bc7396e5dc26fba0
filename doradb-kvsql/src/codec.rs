//! Order preserving encoding of signed 64-bit keys.
//!
//! The unsigned part uses a variable length format of 1 to 9 bytes.
//! Values up to 0x7F take one byte. Larger values subtract the base of
//! their tier and store the remainder big-endian, with the tier flag
//! merged into the leading byte (2-5 bytes) or written as a separate
//! leading byte (6-9 bytes). Leading bytes grow with the tier, so byte
//! order equals numeric order.
//!
//! A signed key `n` is stored as:
//!
//! | key            | bytes                              |
//! |----------------|------------------------------------|
//! | `0..i64::MAX`  | `compress(n + 1)`                  |
//! | `i64::MAX`     | `compress(i64::MAX)` then `0x01`   |
//! | negative       | `0x00` then `compress(n as u64)`   |

use crate::error::{Error, Result};

/// Maximum encoded length of one key.
pub const MAX_ENCODED_LEN: usize = 10;

struct Tier {
    base: u64,
    flag: u8,
    mask: u8,
    /// Payload bytes.
    len: usize,
    /// Flag occupies its own leading byte.
    prefix: bool,
}

const TIERS: [Tier; 9] = [
    Tier { base: 0, flag: 0x00, mask: 0x7F, len: 1, prefix: false },
    Tier { base: 0x80, flag: 0x80, mask: 0x3F, len: 2, prefix: false },
    Tier { base: 0x4080, flag: 0xC0, mask: 0x1F, len: 3, prefix: false },
    Tier { base: 0x20_4080, flag: 0xE0, mask: 0x0F, len: 4, prefix: false },
    Tier { base: 0x1020_4080, flag: 0xF0, mask: 0x07, len: 5, prefix: false },
    Tier { base: 0x08_1020_4080, flag: 0xF8, mask: 0xFF, len: 5, prefix: true },
    Tier { base: 0x0108_1020_4080, flag: 0xF9, mask: 0xFF, len: 6, prefix: true },
    Tier { base: 0x01_0108_1020_4080, flag: 0xFA, mask: 0xFF, len: 7, prefix: true },
    Tier { base: 0x0101_0108_1020_4080, flag: 0xFB, mask: 0xFF, len: 8, prefix: true },
];

#[inline]
fn tier_of(v: u64) -> &'static Tier {
    TIERS
        .iter()
        .zip(TIERS.iter().skip(1))
        .find(|(_, next)| v < next.base)
        .map_or(&TIERS[TIERS.len() - 1], |(t, _)| t)
}

#[inline]
fn tier_of_lead(b: u8) -> Option<&'static Tier> {
    TIERS.iter().find(|t| {
        if t.prefix {
            b == t.flag
        } else {
            b & !t.mask == t.flag
        }
    })
}

fn compress(v: u64, out: &mut Vec<u8>) {
    let tier = tier_of(v);
    let payload = (v - tier.base).to_be_bytes();
    let payload = &payload[8 - tier.len..];
    if tier.prefix {
        out.push(tier.flag);
        out.extend_from_slice(payload);
    } else {
        out.push(payload[0] | tier.flag);
        out.extend_from_slice(&payload[1..]);
    }
}

/// Returns decoded value and number of bytes consumed.
fn decompress(bytes: &[u8]) -> Option<(u64, usize)> {
    let lead = *bytes.first()?;
    let tier = tier_of_lead(lead)?;
    let total = tier.len + tier.prefix as usize;
    if bytes.len() < total {
        return None;
    }
    let payload = &bytes[tier.prefix as usize..total];
    let mut x = 0u64;
    for (i, b) in payload.iter().enumerate() {
        let b = if i == 0 && !tier.prefix { b & tier.mask } else { *b };
        x = (x << 8) | b as u64;
    }
    tier.base.checked_add(x).map(|v| (v, total))
}

/// Append encoded key to the buffer.
pub fn attach_i64(n: i64, out: &mut Vec<u8>) {
    if n < 0 {
        out.push(0);
        compress(n as u64, out);
    } else if n == i64::MAX {
        compress(i64::MAX as u64, out);
        out.push(0x01);
    } else {
        compress(n as u64 + 1, out);
    }
}

#[inline]
pub fn encode_i64(n: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ENCODED_LEN);
    attach_i64(n, &mut out);
    out
}

pub fn decode_i64(bytes: &[u8]) -> Result<i64> {
    match bytes.first() {
        None => Err(Error::Corrupt),
        Some(0) => {
            let (v, sz) = decompress(&bytes[1..]).ok_or(Error::Corrupt)?;
            if sz + 1 != bytes.len() || v <= i64::MAX as u64 {
                return Err(Error::Corrupt);
            }
            Ok(v as i64)
        }
        Some(_) => {
            let (v, sz) = decompress(bytes).ok_or(Error::Corrupt)?;
            if sz == bytes.len() && v <= i64::MAX as u64 {
                Ok(v as i64 - 1)
            } else if sz + 1 == bytes.len() && bytes[sz] == 0x01 && v == i64::MAX as u64 {
                Ok(i64::MAX)
            } else {
                Err(Error::Corrupt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_boundary_values() {
        let values = [
            i64::MIN,
            i64::MIN + 1,
            -0x1_0000,
            -1,
            0,
            1,
            0x7E,
            0x7F,
            0x407E,
            0x407F,
            0x20407F,
            0x1020407F,
            0x081020407F,
            0x01081020407F,
            0x0101081020407F,
            0x010101081020407F,
            i64::MAX - 1,
            i64::MAX,
        ];
        for w in values.windows(2) {
            let (a, b) = (encode_i64(w[0]), encode_i64(w[1]));
            assert!(a < b, "{} {:?} >= {} {:?}", w[0], a, w[1], b);
        }
        for v in values {
            assert_eq!(decode_i64(&encode_i64(v)).unwrap(), v);
        }
        assert_eq!(encode_i64(0), vec![0x01]);
        assert_eq!(encode_i64(0x7E), vec![0x7F]);
        assert_eq!(encode_i64(0x7F), vec![0x80, 0x00]);
        assert_eq!(encode_i64(-1).len(), 10);
        assert_eq!(encode_i64(i64::MAX).len(), MAX_ENCODED_LEN);
        assert_eq!(encode_i64(i64::MAX - 1).len(), 9);
    }

    #[test]
    fn test_random_order() {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<i64> = (0..2000)
            .map(|i| match i % 4 {
                0 => rng.gen(),
                1 => rng.gen_range(-1000..1000),
                2 => rng.gen_range(0..1 << 30),
                _ => rng.gen::<i64>() >> rng.gen_range(0..63u32),
            })
            .collect();
        let mut encoded: Vec<(Vec<u8>, i64)> = keys.iter().map(|k| (encode_i64(*k), *k)).collect();
        keys.sort();
        encoded.sort();
        let decoded: Vec<i64> = encoded
            .iter()
            .map(|(e, k)| {
                assert_eq!(decode_i64(e).unwrap(), *k);
                *k
            })
            .collect();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn test_attach_appends() {
        let mut buf = b"prefix".to_vec();
        attach_i64(300, &mut buf);
        assert_eq!(&buf[..6], b"prefix");
        assert_eq!(decode_i64(&buf[6..]).unwrap(), 300);
    }

    #[test]
    fn test_corrupt_input() {
        assert_eq!(decode_i64(&[]), Err(Error::Corrupt));
        // truncated
        assert_eq!(decode_i64(&[0x80]), Err(Error::Corrupt));
        assert_eq!(decode_i64(&[0xFB, 1, 2]), Err(Error::Corrupt));
        assert_eq!(decode_i64(&[0x00]), Err(Error::Corrupt));
        // trailing garbage
        assert_eq!(decode_i64(&[0x05, 0x00]), Err(Error::Corrupt));
        let mut max = encode_i64(i64::MAX);
        *max.last_mut().unwrap() = 0x02;
        assert_eq!(decode_i64(&max), Err(Error::Corrupt));
        // unknown lead byte
        assert_eq!(decode_i64(&[0xFF; 9]), Err(Error::Corrupt));
        // negative marker followed by a non-negative pattern
        assert_eq!(decode_i64(&[0x00, 0x05]), Err(Error::Corrupt));
    }
}
