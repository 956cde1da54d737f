//! Recursive length prefix encoding, enough for transaction envelopes.

fn length_prefix(len: usize, short: u8, long: u8) -> Vec<u8> {
    if len < 56 {
        return vec![short + len as u8];
    }
    let be = (len as u64).to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    let mut out = vec![long + (8 - skip) as u8];
    out.extend_from_slice(&be[skip..]);
    out
}

pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return vec![bytes[0]];
    }
    let mut out = length_prefix(bytes.len(), 0x80, 0xb7);
    out.extend_from_slice(bytes);
    out
}

/// Integers are big-endian without leading zeros; zero is the empty string.
pub fn encode_uint(n: u128) -> Vec<u8> {
    let be = n.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    encode_bytes(&be[skip..])
}

/// Encodes a big-endian integer given as bytes, stripping leading zeros.
pub fn encode_uint_bytes(be: &[u8]) -> Vec<u8> {
    let skip = be.iter().take_while(|b| **b == 0).count();
    encode_bytes(&be[skip..])
}

/// `items` are already encoded.
pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = length_prefix(payload_len, 0xc0, 0xf7);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}
