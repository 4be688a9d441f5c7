//! CRC-16-XMODEM, used by cluster mode to map a key to one of the 16384
//! hash slots.

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const TABLE: [u16; 256] = build_table();

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        let idx = ((crc >> 8) ^ b as u16) & 0xff;
        crc = (crc << 8) ^ TABLE[idx as usize];
    }
    crc
}

pub const SLOT_COUNT: u16 = 16384;

/// Extracts the `{hash tag}` substring if present, otherwise returns the
/// whole key. A hash tag forces keys that share it onto the same slot,
/// which is what makes multi-key commands safe in cluster mode.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') else {
        return key;
    };
    if close_rel == 0 {
        return key;
    }
    &key[open + 1..open + 1 + close_rel]
}

/// The cluster slot a key maps to: `CRC16(hash_tag(key)) mod 16384`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_standard_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn hash_tag_extracts_the_braced_substring() {
        assert_eq!(hash_tag(b"foo{bar}baz"), b"bar");
        assert_eq!(hash_tag(b"foo"), b"foo");
        assert_eq!(hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(hash_tag(b"{}bar"), b"{}bar");
    }

    #[test]
    fn keys_sharing_a_hash_tag_land_on_the_same_slot() {
        assert_eq!(key_slot(b"user:{42}:profile"), key_slot(b"user:{42}:settings"));
    }

    #[test]
    fn slot_is_always_in_range() {
        for key in [&b"a"[..], b"some-longer-key", b"{}", b""] {
            assert!(key_slot(key) < SLOT_COUNT);
        }
    }
}
